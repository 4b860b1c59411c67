use std::io::Write;

use switchyard::config::{LogFormat, MatchingConfig};

#[test]
fn defaults_are_sensible() {
    let cfg = MatchingConfig::load(None).expect("defaults");
    assert_eq!(cfg.forwarder.max_outstanding_polls, 1);
    assert_eq!(cfg.forwarder.max_outstanding_adds, 1);
    assert_eq!(cfg.forwarder.max_children_per_node, 20);
    assert_eq!(cfg.lease.range_size, 100_000);
    assert_eq!(cfg.matcher.sync_match_timeout_ms, 1_000);
    assert_eq!(cfg.backlog.read_batch_size, 1_000);
    assert_eq!(cfg.queue.idle_timeout_ms, 300_000);
    assert_eq!(cfg.log_format, LogFormat::Text);
}

#[test]
fn toml_overrides_selected_fields() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"
log_format = "json"

[forwarder]
max_rate_per_second = 2
max_children_per_node = 5

[matcher]
sync_match_timeout_ms = 200

[lease]
range_size = 1000
"#
    )
    .expect("write");

    let cfg = MatchingConfig::load(Some(file.path())).expect("load");
    assert_eq!(cfg.log_format, LogFormat::Json);
    assert_eq!(cfg.forwarder.max_rate_per_second, 2);
    assert_eq!(cfg.forwarder.max_children_per_node, 5);
    assert_eq!(cfg.matcher.sync_match_timeout_ms, 200);
    assert_eq!(cfg.lease.range_size, 1_000);
    // Untouched sections keep their defaults.
    assert_eq!(cfg.forwarder.max_outstanding_polls, 1);
    assert_eq!(cfg.backlog.read_batch_size, 1_000);
}

#[test]
fn missing_file_is_an_error() {
    assert!(MatchingConfig::load(Some(std::path::Path::new("/no/such/config.toml"))).is_err());
}
