use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serial_test::serial;

use breakpoint_relay::bridge::DisconnectPolicy;
use breakpoint_relay::config::{post_mortem_enabled, POST_MORTEM_ENV};
use breakpoint_relay::{config::GlobalConfig, AppError};

fn sample_toml(registry: &str) -> String {
    format!(
        r#"
registry_path = '{registry}'
debugger_external = true
node_ip = "10.1.2.3"

[breakpoints]
enabled = false
disconnect = "await_reattach"
descend_timeout_seconds = 3
publish_attempts = 7

[registry]
poll_initial_millis = 20
poll_max_millis = 400
follow_timeout_seconds = 4
reaper_interval_seconds = 60
"#
    )
}

#[test]
fn parses_valid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("registry.db");
    let toml = sample_toml(path.to_str().expect("utf8 path"));

    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");

    assert_eq!(config.registry_path, path);
    assert!(config.debugger_external);
    assert_eq!(
        config.node_ip,
        Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)))
    );
    assert!(!config.breakpoints.enabled);
    assert_eq!(config.breakpoints.disconnect, DisconnectPolicy::AwaitReattach);
    assert_eq!(config.breakpoints.publish_attempts, 7);
    assert_eq!(config.registry.reaper_interval_seconds, 60);
}

#[test]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("config parses");

    assert!(!config.debugger_external);
    assert!(config.breakpoints.enabled);
    assert_eq!(config.breakpoints.disconnect, DisconnectPolicy::Continue);
    assert_eq!(config.breakpoints.descend_timeout_seconds, 10);
    assert_eq!(config.registry.poll_initial_millis, 50);
    assert_eq!(config.registry.poll_max_millis, 1000);
    assert!(config.registry_path.ends_with("registry.db"));
}

#[test]
fn rejects_zero_timeouts() {
    let toml = "[breakpoints]\ndescend_timeout_seconds = 0\n";
    let err = GlobalConfig::from_toml_str(toml).expect_err("zero timeout");
    assert!(
        matches!(&err, AppError::Config(msg) if msg.contains("descend_timeout_seconds")),
        "got {err}"
    );
}

#[test]
fn rejects_zero_publish_attempts() {
    let toml = "[breakpoints]\npublish_attempts = 0\n";
    assert!(GlobalConfig::from_toml_str(toml).is_err());
}

#[test]
fn rejects_inverted_backoff() {
    let toml = "[registry]\npoll_initial_millis = 500\npoll_max_millis = 100\n";
    assert!(GlobalConfig::from_toml_str(toml).is_err());
}

#[test]
fn rejects_unknown_disconnect_policy() {
    let toml = "[breakpoints]\ndisconnect = \"explode\"\n";
    let err = GlobalConfig::from_toml_str(toml).expect_err("bad policy");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn rejects_invalid_field_type() {
    let toml = "debugger_external = \"sometimes\"\n";
    assert!(GlobalConfig::from_toml_str(toml).is_err());
}

#[test]
fn load_from_missing_file_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(temp.path().join("absent.toml"))
        .expect_err("missing file");
    assert!(matches!(err, AppError::Config(_)));
}

// ── Derived settings ────────────────────────────────────────────────────────

#[test]
fn loopback_settings_by_default() {
    let config = GlobalConfig::for_registry("/tmp/unused.db");
    let settings = config.bridge_settings().expect("settings");

    assert_eq!(settings.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(settings.advertised_host, "127.0.0.1");
    assert_eq!(settings.descend_timeout, Duration::from_secs(10));
}

#[test]
fn external_settings_advertise_node_ip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().join("r.db").to_str().expect("utf8"));
    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");

    let settings = config.bridge_settings().expect("settings");
    assert_eq!(settings.advertised_host, "10.1.2.3");
    assert!(settings.bind_ip.is_unspecified());
    assert_eq!(settings.disconnect, DisconnectPolicy::AwaitReattach);
    assert_eq!(settings.publish_attempts, 7);
    assert_eq!(settings.backoff.initial, Duration::from_millis(20));
    assert_eq!(settings.backoff.max, Duration::from_millis(400));
}

#[test]
fn bind_ip_override_applies() {
    let toml = "bind_ip = \"127.0.0.1\"\ndebugger_external = true\nnode_ip = \"10.0.0.9\"\n";
    let config = GlobalConfig::from_toml_str(toml).expect("config parses");

    let settings = config.bridge_settings().expect("settings");
    assert_eq!(settings.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(settings.advertised_host, "10.0.0.9");
}

#[test]
fn client_settings_follow_registry_section() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().join("r.db").to_str().expect("utf8"));
    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");

    let client = config.client_settings();
    assert_eq!(client.follow_timeout, Duration::from_secs(4));
    assert_eq!(config.reaper_interval(), Duration::from_secs(60));
}

// ── Post-mortem toggle ──────────────────────────────────────────────────────

#[test]
#[serial]
fn post_mortem_enabled_only_by_one() {
    std::env::set_var(POST_MORTEM_ENV, "1");
    assert!(post_mortem_enabled());

    std::env::set_var(POST_MORTEM_ENV, "true");
    assert!(!post_mortem_enabled());

    std::env::set_var(POST_MORTEM_ENV, "0");
    assert!(!post_mortem_enabled());

    std::env::remove_var(POST_MORTEM_ENV);
    assert!(!post_mortem_enabled());
}
