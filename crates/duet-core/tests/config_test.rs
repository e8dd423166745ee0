use duet_core::config::Config;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, "text");
    assert_eq!(cfg.orchestrator.max_attempts, 3);
    assert_eq!(cfg.orchestrator.call_timeout_secs, 300);
    assert_eq!(cfg.session.summary_window, 5);
    assert_eq!(cfg.session.summary_max_chars, 2_000);
    assert!((cfg.budget.warning_threshold_pct - 80.0).abs() < f64::EPSILON);
    assert!(cfg.budget.daily_max_tokens.is_none());
    assert_eq!(cfg.executor.binary, "claude");
    assert!(cfg.dispatcher.webhook_url.is_none());
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let mut cfg = Config::default();
    cfg.budget.daily_max_cost_usd = Some(25.0);
    let toml_str = cfg.to_toml().expect("serialize to toml");

    let parsed = Config::from_toml(&toml_str).expect("parse toml back");
    assert_eq!(parsed.orchestrator.max_attempts, cfg.orchestrator.max_attempts);
    assert_eq!(parsed.budget.daily_max_cost_usd, Some(25.0));
    assert_eq!(parsed.planner.model, cfg.planner.model);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[budget]
daily_max_tokens = 100000
warning_threshold_pct = 90.0

[orchestrator]
max_attempts = 5

[[pricing]]
model = "local-model"
input_cost_per_1m = 0.5
output_cost_per_1m = 1.5
"#;
    let cfg = Config::from_toml(partial).expect("parse partial");
    assert_eq!(cfg.budget.daily_max_tokens, Some(100_000));
    assert_eq!(cfg.orchestrator.max_attempts, 5);
    assert_eq!(cfg.pricing.len(), 1);
    // defaults should fill in the rest
    assert_eq!(cfg.orchestrator.call_timeout_secs, 300);
    assert_eq!(cfg.session.summary_max_chars, 2_000);
}

#[test]
fn zero_attempts_fails_validation() {
    let err = Config::from_toml("[orchestrator]\nmax_attempts = 0\n").expect_err("must fail");
    assert!(err.to_string().contains("max_attempts"));
}

#[test]
fn zero_timeout_fails_validation() {
    let err = Config::from_toml("[orchestrator]\ncall_timeout_secs = 0\n").expect_err("must fail");
    assert!(err.to_string().contains("call_timeout_secs"));
}

#[test]
fn warning_threshold_out_of_range_fails_validation() {
    let mut cfg = Config::default();
    cfg.budget.warning_threshold_pct = 120.0;
    assert!(cfg.validate().is_err());
    cfg.budget.warning_threshold_pct = 0.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from(dir.path().join("nope.toml")).unwrap_err();
    assert!(err.to_string().starts_with("io:"));
}
