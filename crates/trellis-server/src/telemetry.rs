//! Shutdown telemetry.
//!
//! Every shutdown call records one [`ShutdownTelemetry`]. The most recent
//! one is kept on the application and served by the debug handler.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Timings and counters for one shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownTelemetry {
    /// When the shutdown call started.
    pub started_at: DateTime<Utc>,
    /// When the shutdown call finished.
    pub completed_at: DateTime<Utc>,
    /// Wall time of the whole call.
    #[serde(serialize_with = "human_duration")]
    pub total_duration: Duration,
    /// Time spent waiting for plain connections to finish.
    #[serde(serialize_with = "human_duration")]
    pub drain_duration: Duration,
    /// Time spent in pre-shutdown hooks.
    #[serde(serialize_with = "human_duration")]
    pub pre_hooks_duration: Duration,
    /// Time spent closing WebSocket and SSE connections.
    #[serde(serialize_with = "human_duration")]
    pub graceful_close_duration: Duration,
    /// Time spent in post-shutdown hooks.
    #[serde(serialize_with = "human_duration")]
    pub post_hooks_duration: Duration,
    /// Connections open when shutdown started.
    pub initial_conns: usize,
    /// Connections that finished on their own.
    pub drained_conns: usize,
    /// Connections closed by force.
    pub forced_conns: usize,
    /// WebSockets closed with a close handshake.
    pub web_sockets_closed: usize,
    /// SSE streams closed after the shutdown event.
    #[serde(rename = "sSEsClosed")]
    pub sses_closed: usize,
    /// The deadline fired before draining finished.
    pub timed_out: bool,
}

/// Body of the shutdown debug endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSnapshot {
    /// `"running"` or `"shutdown"`.
    pub status: &'static str,
    /// Live connections.
    pub active_connections: usize,
    /// The last completed shutdown, if any.
    pub last_shutdown: Option<ShutdownTelemetry>,
}

fn human_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*duration))
}

/// Formats a duration compactly: `"0s"`, `"750µs"`, `"12.5ms"`, `"1.2s"`,
/// `"1m30s"`, `"2h0m5s"`. Sub-unit parts keep at most three decimals.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos as f64 / 1e3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos as f64 / 1e6));
    }

    let total = duration.as_secs();
    let (hours, minutes) = (total / 3600, (total % 3600) / 60);
    let seconds = (total % 60) as f64 + f64::from(duration.subsec_nanos()) / 1e9;
    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{}s", decimal(seconds));
    out
}

fn decimal(value: f64) -> String {
    let s = format!("{value:.3}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_nanos(250)), "250ns");
        assert_eq!(format_duration(Duration::from_micros(750)), "750µs");
        assert_eq!(format_duration(Duration::from_micros(12_500)), "12.5ms");
        assert_eq!(format_duration(Duration::from_millis(1200)), "1.2s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(7205)), "2h0m5s");
    }

    #[test]
    fn test_telemetry_json_shape() {
        let now = Utc::now();
        let telemetry = ShutdownTelemetry {
            started_at: now,
            completed_at: now,
            total_duration: Duration::from_millis(1200),
            drain_duration: Duration::from_millis(500),
            pre_hooks_duration: Duration::ZERO,
            graceful_close_duration: Duration::ZERO,
            post_hooks_duration: Duration::ZERO,
            initial_conns: 3,
            drained_conns: 2,
            forced_conns: 1,
            web_sockets_closed: 0,
            sses_closed: 1,
            timed_out: true,
        };
        let json = serde_json::to_value(&telemetry).unwrap();
        for key in [
            "startedAt",
            "completedAt",
            "totalDuration",
            "drainDuration",
            "preHooksDuration",
            "gracefulCloseDuration",
            "postHooksDuration",
            "initialConns",
            "drainedConns",
            "forcedConns",
            "webSocketsClosed",
            "sSEsClosed",
            "timedOut",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["totalDuration"], "1.2s");
        assert_eq!(json["timedOut"], true);
        assert!(DateTime::parse_from_rfc3339(json["startedAt"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_snapshot_shape() {
        let snapshot = ShutdownSnapshot {
            status: "running",
            active_connections: 2,
            last_shutdown: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "running", "activeConnections": 2, "lastShutdown": null})
        );
    }
}
