//! Tests for logging configuration parsing
//!
//! Exercises the pure helpers that turn LOG_LEVEL, LOG_FORMAT and LOG_SPANS
//! values into logging settings.

use amqp_streamer::observability::logging::{parse_flag, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_known_values() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    assert_eq!(LogFormat::parse("123"), LogFormat::Json);
}

#[test]
fn test_log_format_parse_whitespace() {
    assert_eq!(LogFormat::parse("  json  "), LogFormat::Json);
    assert_eq!(LogFormat::parse("pretty\n"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("\tcompact"), LogFormat::Compact);
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("Debug"), Level::DEBUG);
    assert_eq!(parse_level(" trace "), Level::TRACE);
    assert_eq!(parse_level("info"), Level::INFO);
}

#[test]
fn test_unknown_log_level_defaults_to_info() {
    assert_eq!(parse_level(""), Level::INFO);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_span_flag_parsing() {
    assert!(parse_flag("true"));
    assert!(parse_flag("TRUE"));
    assert!(parse_flag(" true\n"));
    assert!(!parse_flag("false"));
    assert!(!parse_flag("1"));
    assert!(!parse_flag(""));
}
