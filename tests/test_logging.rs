//! Tests for log format and level parsing

use biotrack_device::observability::logging::{filter_directives, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for input in ["", "xml", "yaml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json);
    }
}

#[test]
fn test_log_format_parse_trims_whitespace() {
    assert_eq!(LogFormat::parse("  compact  "), LogFormat::Compact);
    assert_eq!(LogFormat::parse("pretty\n"), LogFormat::Pretty);
}

#[test]
fn test_parse_level() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("warning"), Level::WARN);
    assert_eq!(parse_level(" debug "), Level::DEBUG);
    assert_eq!(parse_level("trace"), Level::TRACE);
    assert_eq!(parse_level("info"), Level::INFO);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_filter_directives_quiet_dependencies() {
    let directives = filter_directives(Level::DEBUG);
    assert!(directives.starts_with("debug"));
    assert!(directives.contains("rumqttc=warn"));
    assert!(directives.contains("reqwest=warn"));
    assert!(!directives.contains("biotrack_device"));
}
