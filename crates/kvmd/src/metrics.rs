//! Prometheus text exposition for `GET /metrics`. Ambient addition: the
//! distilled spec only names the route and its auth gate, not a format —
//! Prometheus text is the natural fit given the rest of this daemon's
//! observability stack (`tracing` everywhere else).

use std::fmt::Write as _;

/// Snapshot of the counters/gauges exposed on `/metrics`, assembled by
/// `web.rs` from whichever module owns each value.
pub struct MetricsSnapshot {
    pub active_sessions: u64,
    pub uptime_secs: u64,
    pub logins_attempted: u64,
    pub logins_failed: u64,
    pub cloud_registrations: u64,
    pub lan_ping_rtt_ms: u64,
}

struct Metric {
    name: &'static str,
    help: &'static str,
    kind: &'static str,
    value: u64,
}

/// Renders `snapshot` as Prometheus text exposition format (the `text/plain;
/// version=0.0.4` wire format: `# HELP`/`# TYPE` comment pair per metric,
/// then one `name value` sample line).
pub fn render(snapshot: &MetricsSnapshot) -> String {
    let metrics = [
        Metric {
            name: "kvmd_active_sessions",
            help: "Number of active WebRTC sessions",
            kind: "gauge",
            value: snapshot.active_sessions,
        },
        Metric {
            name: "kvmd_uptime_seconds",
            help: "Daemon uptime in seconds",
            kind: "gauge",
            value: snapshot.uptime_secs,
        },
        Metric {
            name: "kvmd_total_logins_attempted",
            help: "Total local login attempts",
            kind: "counter",
            value: snapshot.logins_attempted,
        },
        Metric {
            name: "kvmd_total_logins_failed",
            help: "Total failed local login attempts",
            kind: "counter",
            value: snapshot.logins_failed,
        },
        Metric {
            name: "kvmd_cloud_registrations_total",
            help: "Total successful cloud registrations",
            kind: "counter",
            value: snapshot.cloud_registrations,
        },
        Metric {
            name: "kvmd_lan_signaling_ping_rtt_milliseconds",
            help: "Last LAN signaling ping RTT",
            kind: "gauge",
            value: snapshot.lan_ping_rtt_ms,
        },
    ];

    let mut body = String::new();
    for metric in &metrics {
        let _ = writeln!(body, "# HELP {} {}", metric.name, metric.help);
        let _ = writeln!(body, "# TYPE {} {}", metric.name, metric.kind);
        let _ = writeln!(body, "{} {}", metric.name, metric.value);
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: 1,
            uptime_secs: 42,
            logins_attempted: 3,
            logins_failed: 1,
            cloud_registrations: 0,
            lan_ping_rtt_ms: 12,
        }
    }

    #[test]
    fn render_includes_help_and_type_for_every_metric() {
        let text = render(&sample_snapshot());
        assert!(text.contains("# HELP kvmd_active_sessions"));
        assert!(text.contains("# TYPE kvmd_active_sessions gauge"));
        assert!(text.contains("kvmd_active_sessions 1"));
    }

    #[test]
    fn render_reports_counters_as_counter_type() {
        let text = render(&sample_snapshot());
        assert!(text.contains("# TYPE kvmd_total_logins_attempted counter"));
        assert!(text.contains("kvmd_total_logins_attempted 3"));
    }

    #[test]
    fn render_is_stable_for_same_snapshot() {
        let snapshot = sample_snapshot();
        assert_eq!(render(&snapshot), render(&snapshot));
    }
}
