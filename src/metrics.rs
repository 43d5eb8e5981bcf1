//! Operational metrics.
//!
//! Two outputs: the `MetricsSink` the scheduler emits per-cycle numbers to
//! (Graphite plaintext in production, nothing when unconfigured), and the
//! process-wide Prometheus registry served on `/metrics`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{Counter, Encoder, Gauge, GaugeVec, Histogram, Opts, TextEncoder};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

// ============================================================================
// PROMETHEUS
// ============================================================================

pub static CYCLES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("via_analyzer_cycles_total", "Completed analysis cycles").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static CYCLE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "via_analyzer_cycle_duration_seconds",
            "Wall-clock time of a full cycle",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

pub static CLASSIFY_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "via_analyzer_classify_duration_seconds",
        "Time spent classifying a single series",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

pub static SERIES_TOTAL: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("via_analyzer_series_total", "Metric universe size, last cycle").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static SERIES_ANALYZED: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new(
        "via_analyzer_series_analyzed",
        "Series successfully classified, last cycle",
    )
    .unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static ANOMALIES: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("via_analyzer_anomalies", "Anomalous series, last cycle").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static FAILURES: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        Opts::new("via_analyzer_failures", "Unanalyzed series by cause, last cycle"),
        &["cause"],
    )
    .unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static VOTES: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        Opts::new(
            "via_analyzer_votes",
            "Anomalous series each algorithm voted for, last cycle",
        ),
        &["algorithm"],
    )
    .unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static ALERTS_DISPATCHED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("via_analyzer_alerts_dispatched_total", "Alerts sent").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ALERTS_SUPPRESSED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "via_analyzer_alerts_suppressed_total",
        "Alerts skipped because the rule is cooling down",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ALERTS_FAILED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "via_analyzer_alerts_failed_total",
        "Alert evaluations that hit a store or sink error",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static STORE_ERRORS: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "via_analyzer_store_errors_total",
        "Failed store probes and fetches",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static WORKERS_LOST: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "via_analyzer_workers_lost_total",
        "Workers that timed out, panicked or failed their fetch",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

/// Touch every metric so they show up before the first cycle finishes.
pub fn init() {
    let _ = &*CYCLES_TOTAL;
    let _ = &*CYCLE_DURATION;
    let _ = &*CLASSIFY_LATENCY;
    let _ = &*SERIES_TOTAL;
    let _ = &*SERIES_ANALYZED;
    let _ = &*ANOMALIES;
    let _ = &*FAILURES;
    let _ = &*VOTES;
    let _ = &*ALERTS_DISPATCHED;
    let _ = &*ALERTS_SUPPRESSED;
    let _ = &*ALERTS_FAILED;
    let _ = &*STORE_ERRORS;
    let _ = &*WORKERS_LOST;
}

/// Prometheus text exposition of the default registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// ============================================================================
// SINKS
// ============================================================================

/// Fire-and-forget numeric metric output.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn emit(&self, path: &str, value: f64);
}

/// Used when no sink is configured.
pub struct NullSink;

#[async_trait]
impl MetricsSink for NullSink {
    async fn emit(&self, _path: &str, _value: f64) {}
}

/// Carbon plaintext protocol: `<path> <value> <unix_ts>\n` over TCP.
pub struct GraphiteSink {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
    connect_timeout: Duration,
}

impl GraphiteSink {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            conn: Mutex::new(None),
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn line(path: &str, value: f64, ts: i64) -> String {
        format!("{} {} {}\n", path, value, ts)
    }

    async fn send(&self, line: &str) -> std::io::Result<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_none() {
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;
            *slot = Some(stream);
        }

        if let Some(stream) = slot.as_mut() {
            if let Err(e) = stream.write_all(line.as_bytes()).await {
                // drop the broken connection; the next emit reconnects
                *slot = None;
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsSink for GraphiteSink {
    async fn emit(&self, path: &str, value: f64) {
        let line = Self::line(path, value, chrono::Utc::now().timestamp());
        if let Err(e) = self.send(&line).await {
            debug!(addr = %self.addr, error = %e, "graphite send failed");
        }
    }
}

/// Dotted prefix for emitted paths: `<prefix>.` or `<prefix>.<server>.`.
pub fn metric_prefix(prefix: &str, server_name: Option<&str>) -> String {
    match server_name.filter(|s| !s.is_empty()) {
        Some(server) => format!("{}.{}.", prefix, server),
        None => format!("{}.", prefix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_metric_prefix() {
        assert_eq!(metric_prefix("via.analyzer", None), "via.analyzer.");
        assert_eq!(metric_prefix("via.analyzer", Some("")), "via.analyzer.");
        assert_eq!(
            metric_prefix("via.analyzer", Some("web01")),
            "via.analyzer.web01."
        );
    }

    #[test]
    fn test_graphite_line() {
        assert_eq!(
            GraphiteSink::line("via.analyzer.run_time", 2.5, 1_700_000_000),
            "via.analyzer.run_time 2.5 1700000000\n"
        );
    }

    #[tokio::test]
    async fn test_graphite_sink_writes_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let sink = GraphiteSink::new("127.0.0.1", port);
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = String::new();
            socket.read_to_string(&mut buf).await.unwrap();
            buf
        });

        sink.emit("via.analyzer.total_metrics", 3.0).await;
        sink.emit("via.analyzer.total_anomalies", 1.0).await;
        drop(sink);

        let received = server.await.unwrap();
        let lines: Vec<&str> = received.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("via.analyzer.total_metrics 3 "));
        assert!(lines[1].starts_with("via.analyzer.total_anomalies 1 "));
    }

    #[tokio::test]
    async fn test_unreachable_graphite_is_silent() {
        // port 9 on localhost is almost never listening
        let sink = GraphiteSink::new("127.0.0.1", 9);
        sink.emit("via.analyzer.run_time", 1.0).await;
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        init();
        CYCLES_TOTAL.inc();
        assert!(render().contains("via_analyzer_cycles_total"));
    }
}
