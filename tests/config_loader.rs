// tests/config_loader.rs
use newsflow::config::{load_settings_default, load_settings_from};
use std::{env, fs};

const ENV_KEYS: &[&str] = &[
    "NEWSFLOW_CONFIG_PATH",
    "WEBHOOK_SECRET",
    "EVENT_RATE_LIMIT",
    "FEED_DATA_FILE",
    "POLL_BASELINE_SECONDS",
];

fn clear_env() {
    for k in ENV_KEYS {
        env::remove_var(k);
    }
}

#[serial_test::serial]
#[test]
fn toml_and_json_files_load() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();

    let p_toml = dir.path().join("newsflow.toml");
    fs::write(
        &p_toml,
        r#"
json_logs = true

[webhook]
secret = "s3"

[[scheduler.feeds]]
name = "fed"
url = "https://www.federalreserve.gov/feeds/press_all.xml"
"#,
    )
    .unwrap();
    let s = load_settings_from(&p_toml).unwrap();
    assert!(s.json_logs);
    assert_eq!(s.webhook.secret, "s3");
    assert_eq!(s.scheduler.feeds[0].name, "fed");

    let p_json = dir.path().join("newsflow.json");
    fs::write(&p_json, r#"{"bus":{"rate_limit_per_sec":3.0}}"#).unwrap();
    let s = load_settings_from(&p_json).unwrap();
    assert_eq!(s.bus.rate_limit_per_sec, 3.0);
    assert_eq!(s.hub.poll_quantum_secs, 5);

    let broken = dir.path().join("broken.toml");
    fs::write(&broken, "[bus\nrate = ").unwrap();
    assert!(load_settings_from(&broken).is_err());
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    clear_env();
    // Isolate the cwd so the repository's own config/ is not read.
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();

    // 1) nothing on disk: defaults
    let s = load_settings_default().unwrap();
    assert!(s.scheduler.feeds.is_empty());
    assert_eq!(s.webhook.path, "/push/inbound");

    // 2) ./config/newsflow.toml fallback
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(cfg_dir.join("newsflow.toml"), "[hub]\nheartbeat_every = 7\n").unwrap();
    let s = load_settings_default().unwrap();
    assert_eq!(s.hub.heartbeat_every, 7);

    // 3) NEWSFLOW_CONFIG_PATH wins
    let p_env = tmp.path().join("elsewhere.json");
    fs::write(&p_env, r#"{"hub":{"heartbeat_every":9}}"#).unwrap();
    env::set_var("NEWSFLOW_CONFIG_PATH", p_env.display().to_string());
    let s = load_settings_default().unwrap();
    assert_eq!(s.hub.heartbeat_every, 9);

    // 4) pointing at nothing is an error, not a silent fallback
    env::set_var("NEWSFLOW_CONFIG_PATH", tmp.path().join("missing.toml").display().to_string());
    assert!(load_settings_default().is_err());

    clear_env();
    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn env_overrides_beat_file_values() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("newsflow.toml");
    fs::write(
        &p,
        r#"
[bus]
rate_limit_per_sec = 2.0

[webhook]
secret = "from-file"

[scheduler]
min_secs = 1
"#,
    )
    .unwrap();

    env::set_var("WEBHOOK_SECRET", "from-env");
    env::set_var("EVENT_RATE_LIMIT", "25");
    env::set_var("FEED_DATA_FILE", "/tmp/newsflow-feeds.json");
    let s = load_settings_from(&p).unwrap();
    clear_env();

    assert_eq!(s.webhook.secret, "from-env");
    assert_eq!(s.bus.rate_limit_per_sec, 25.0);
    assert_eq!(
        s.scheduler.snapshot_path,
        std::path::PathBuf::from("/tmp/newsflow-feeds.json")
    );
    // sanitize floor
    assert_eq!(s.scheduler.min_secs, 10);
}
