use anyhow::Context;
use pic::{PipelineConfig, PipelineContext};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Simulated service call: mostly fast, occasionally failing.
fn charge_card(i: u64) -> Result<u64, String> {
    std::thread::sleep(Duration::from_micros(200 + (i % 7) * 30));
    if i % 97 == 0 {
        Err(format!("card declined for order {}", i))
    } else {
        Ok(i * 3)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Config (optional path as the first argument)
    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(&path).with_context(|| format!("loading config from {}", path))?,
        None => PipelineConfig::default(),
    };
    tracing::info!("PIC demo booting...");

    let pipeline = Arc::new(PipelineContext::new(config).context("building pipeline")?);
    pipeline.start()?;
    pipeline.on_security_violation(|signed, decision| {
        tracing::error!("Security violation from '{}': {}", signed.source(), decision.reason);
    });

    // 3. Normal traffic builds the baseline
    for i in 1..=200u64 {
        let args = format!("order={} user=buyer{}@shop.example", i, i % 5);
        let _ = pipeline.measure_with_args("checkout.charge_card", &args, || charge_card(i));
    }

    // 4. A burst of very slow calls stands out against it
    for i in 0..5u64 {
        let _ = pipeline.measure("checkout.charge_card", || {
            std::thread::sleep(Duration::from_millis(25));
            charge_card(1_000 + i)
        });
    }

    // 5. A captured event sent twice is rejected the second time
    let captured = pipeline.sign(pic::TelemetryEvent::new(
        "checkout.charge_card",
        pic::kernel::time::unix_now(),
        1.2,
        pic::Outcome::Success,
        "order=<num>",
        pipeline.next_sequence(),
    ))?;
    let first = pipeline.deliver(captured.clone()).await;
    let second = pipeline.deliver(captured).await;
    println!("original: {} ({}), replay: {} ({})", first.verdict, first.reason, second.verdict, second.reason);

    // 6. Drain and report
    let report = pipeline.shutdown().await;
    println!("shutdown: drained={} discarded={}", report.drained, report.discarded);
    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    Ok(())
}
