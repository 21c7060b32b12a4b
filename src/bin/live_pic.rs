use pic::kernel::time::unix_now;
use pic::{Outcome, PipelineConfig, PipelineContext, SignedEvent, TelemetryEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const HELP: &str = "Commands:
  <source> <duration_ms> [ok|error|panic] [args...]   decide one event
  replay                                              resend the last signed event
  tamper                                              resend it with a changed duration
  stats                                               print pipeline statistics
  quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Setup Logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // 2. Setup Pipeline (small training window so decisions show up quickly)
    let config = PipelineConfig {
        baseline_min_samples: 5,
        ..PipelineConfig::default()
    };
    let pipeline = PipelineContext::new(config)?;
    let mut last: Option<SignedEvent> = None;

    println!("{}", HELP);

    // 3. Read events from stdin
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] => break,
            ["stats"] => println!("{}", serde_json::to_string_pretty(&pipeline.stats())?),
            ["replay"] => match &last {
                Some(signed) => {
                    let decision = pipeline.deliver(signed.clone()).await;
                    println!("{} score={:.3} {}", decision.verdict, decision.score, decision.reason);
                }
                None => println!("nothing to replay yet"),
            },
            ["tamper"] => match &last {
                Some(signed) => {
                    let mut forged = signed.clone();
                    forged.event.duration_ms = 0.1;
                    let decision = pipeline.deliver(forged).await;
                    println!("{} score={:.3} {}", decision.verdict, decision.score, decision.reason);
                }
                None => println!("nothing to tamper with yet"),
            },
            [source, duration, rest @ ..] => {
                let Ok(duration_ms) = duration.parse::<f64>() else {
                    println!("duration must be a number\n{}", HELP);
                    continue;
                };
                let (outcome, args) = match rest {
                    ["error", args @ ..] => (Outcome::Error, args),
                    ["panic", args @ ..] => (Outcome::Exception("panic".into()), args),
                    ["ok", args @ ..] => (Outcome::Success, args),
                    args => (Outcome::Success, args),
                };
                let event = TelemetryEvent::new(
                    *source,
                    unix_now(),
                    duration_ms,
                    outcome,
                    pipeline.redact_args(&args.join(" ")),
                    pipeline.next_sequence(),
                );
                let signed = pipeline.sign(event)?;
                let decision = pipeline.deliver(signed.clone()).await;
                println!("{} score={:.3} {}", decision.verdict, decision.score, decision.reason);
                last = Some(signed);
            }
            _ => println!("{}", HELP),
        }
    }

    pipeline.shutdown().await;
    Ok(())
}
