//! Wire protocol for the Instrumental collector
//!
//! The collector speaks a plain ASCII line protocol, one command per line:
//!
//! ```text
//! hello version <client>/<version> platform <os>/<osVersion> hostname <host>\n
//! authenticate <apiKey>\n
//! increment <metric> <amount> <timestamp>\n
//! gauge[_absolute] <metric> <value> <timestamp>\n
//! ```
//!
//! Only `hello` and `authenticate` are acknowledged by the server (the exact
//! literal `"ok\n"`); metric lines are fire-and-forget.

use chrono::Utc;

use crate::config::ClientIdentity;

/// Kind of message written to the collector.
///
/// The kind doubles as the write tag: a completed write reports its kind back
/// to the session, which uses [`MessageKind::expects_response`] to decide
/// whether to arm a response read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    Auth,
    Increment,
    Gauge,
}

impl MessageKind {
    /// Command token this kind uses on the wire
    pub fn wire_command(&self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::Auth => "authenticate",
            MessageKind::Increment => "increment",
            MessageKind::Gauge => "gauge",
        }
    }

    /// Whether the server acknowledges this message with a response line
    pub fn expects_response(&self) -> bool {
        matches!(self, MessageKind::Hello | MessageKind::Auth)
    }
}

/// Acknowledgment the server sends for accepted handshake commands
pub const ACK: &str = "ok\n";

/// Current time as fractional seconds since the Unix epoch.
///
/// Metric lines carry the timestamp of the original call, not of the eventual
/// flush, so this is sampled when the line is built.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Join the configured prefix onto a metric name, if any
pub fn full_metric_name(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(base) => format!("{}.{}", base, name),
        None => name.to_string(),
    }
}

/// Build the `hello` line announcing this client to the collector
pub fn hello_line(identity: &ClientIdentity) -> String {
    format!(
        "{} version {}/{} platform {}/{} hostname {}\n",
        MessageKind::Hello.wire_command(),
        identity.client_name,
        identity.client_version,
        identity.platform,
        identity.platform_version,
        identity.hostname,
    )
}

/// Build the `authenticate` line carrying the API key
pub fn authenticate_line(api_key: &str) -> String {
    format!("{} {}\n", MessageKind::Auth.wire_command(), api_key)
}

/// Build an `increment` line for a counter metric
pub fn increment_line(full_name: &str, amount: i64, timestamp: f64) -> String {
    format!(
        "{} {} {} {}\n",
        MessageKind::Increment.wire_command(),
        full_name,
        amount,
        timestamp,
    )
}

/// Build a `gauge` (or `gauge_absolute`) line for a gauge metric
pub fn gauge_line(full_name: &str, value: f64, absolute: bool, timestamp: f64) -> String {
    let command = if absolute {
        "gauge_absolute"
    } else {
        MessageKind::Gauge.wire_command()
    };
    format!("{} {} {} {}\n", command, full_name, value, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> ClientIdentity {
        ClientIdentity {
            client_name: "instrumental-core".to_string(),
            client_version: "0.1.0".to_string(),
            platform: "Linux".to_string(),
            platform_version: "6.1".to_string(),
            hostname: "build-box".to_string(),
        }
    }

    #[test]
    fn test_wire_commands() {
        assert_eq!(MessageKind::Hello.wire_command(), "hello");
        assert_eq!(MessageKind::Auth.wire_command(), "authenticate");
        assert_eq!(MessageKind::Increment.wire_command(), "increment");
        assert_eq!(MessageKind::Gauge.wire_command(), "gauge");
    }

    #[test]
    fn test_response_expected_only_for_handshake() {
        assert!(MessageKind::Hello.expects_response());
        assert!(MessageKind::Auth.expects_response());
        assert!(!MessageKind::Increment.expects_response());
        assert!(!MessageKind::Gauge.expects_response());
    }

    #[test]
    fn test_hello_line_format() {
        let line = hello_line(&test_identity());
        assert_eq!(
            line,
            "hello version instrumental-core/0.1.0 platform Linux/6.1 hostname build-box\n"
        );
    }

    #[test]
    fn test_authenticate_line_format() {
        assert_eq!(authenticate_line("abc123"), "authenticate abc123\n");
    }

    #[test]
    fn test_increment_line_format() {
        let line = increment_line("x", 5, 1700000000.25);
        assert_eq!(line, "increment x 5 1700000000.25\n");
    }

    #[test]
    fn test_gauge_line_format() {
        let line = gauge_line("y", 3.5, false, 1700000000.25);
        assert_eq!(line, "gauge y 3.5 1700000000.25\n");

        let line = gauge_line("y", 3.5, true, 1700000000.25);
        assert_eq!(line, "gauge_absolute y 3.5 1700000000.25\n");
    }

    #[test]
    fn test_full_metric_name_with_prefix() {
        assert_eq!(full_metric_name(Some("app"), "x"), "app.x");
        assert_eq!(full_metric_name(None, "x"), "x");
    }

    #[test]
    fn test_timestamp_is_fractional_epoch_seconds() {
        let ts = unix_timestamp();
        // Sanity window: after 2020, before 2100
        assert!(ts > 1_577_836_800.0);
        assert!(ts < 4_102_444_800.0);

        // Survives the wire format as a float
        let line = increment_line("x", 1, ts);
        let field = line.trim_end().rsplit(' ').next().unwrap();
        let parsed: f64 = field.parse().unwrap();
        assert!((parsed - ts).abs() < 1.0);
    }
}
