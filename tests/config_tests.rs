use pic::{ConfigError, FailMode, PipelineConfig};
use std::io::Write;

#[test]
fn test_empty_object_is_default() {
    let config = PipelineConfig::from_json_str("{}").unwrap();
    assert_eq!(config.sampling_rate, 1.0);
    assert_eq!(config.queue_capacity, 10_000);
    assert_eq!(config.fail_mode, FailMode::Open);
    assert_eq!(config.brain_timeout_ms, 50);
    assert_eq!(config.retry_attempts, 3);
    assert_eq!(config.nonce_freshness_window_s, 300);
    assert_eq!(config.anomaly_threshold, 0.7);
    assert_eq!(config.error_threshold, 10);
    assert_eq!(config.degraded_mode_threshold, 50);
    assert!(config.pattern_cache_enabled);
    assert_eq!(config.pattern_cache_ttl_s, 1_800);
}

#[test]
fn test_partial_override() {
    let config = PipelineConfig::from_json_str(r#"{"fail_mode": "closed", "source_lane_capacity": 8}"#).unwrap();
    assert_eq!(config.fail_mode, FailMode::Closed);
    assert_eq!(config.source_lane_capacity, 8);
    assert_eq!(config.per_function_rate_limit, 1_000);
}

#[test]
fn test_out_of_range_values_are_rejected() {
    let err = PipelineConfig::from_json_str(r#"{"sampling_rate": 1.5}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "sampling_rate", .. }), "{}", err);

    let err = PipelineConfig::from_json_str(r#"{"pattern_match_threshold": -0.1}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "pattern_match_threshold", .. }));

    let err = PipelineConfig::from_json_str(r#"{"queue_capacity": 0}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "queue_capacity", .. }));

    let err = PipelineConfig::from_json_str(r#"{"error_threshold": 20, "degraded_mode_threshold": 5}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "degraded_mode_threshold", .. }));
}

#[test]
fn test_malformed_json() {
    let err = PipelineConfig::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("pic-config-{}.json", uuid::Uuid::new_v4()));
    {
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"anomaly_threshold": 0.85, "retry_attempts": 5}}"#).unwrap();
    }
    let config = PipelineConfig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(config.anomaly_threshold, 0.85);
    assert_eq!(config.retry_attempts, 5);

    assert!(matches!(
        PipelineConfig::load(std::env::temp_dir().join("pic-does-not-exist.json")),
        Err(ConfigError::Io(_))
    ));
}
