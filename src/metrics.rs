//! Prometheus-format metrics (RED: Rate, Errors, Duration) and the small HTTP
//! endpoint that serves them.

use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Upper bounds of the latency histogram buckets, in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Operations tracked individually, named as `ProtocolOp::name` names them.
pub const OPERATIONS: [&str; 8] = [
    "bind", "search", "modify", "add", "delete", "modifydn", "compare", "extended",
];

fn op_index(op: &str) -> Option<usize> {
    OPERATIONS.iter().position(|o| *o == op)
}

/// Non-cumulative buckets plus count and sum (microseconds).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OpMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

/// Lock-free counters shared by every connection.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    connections_active: AtomicI64,
    protocol_errors: AtomicU64,
    abandoned: AtomicU64,
    start_tls: AtomicU64,
    ops: [OpMetrics; 8],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Connection-fatal framing or envelope errors.
    #[inline]
    pub fn inc_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_start_tls(&self) {
        self.start_tls.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one completed request. `success` is false for any result code
    /// other than success, compareTrue or compareFalse.
    pub fn record(&self, op: &str, success: bool, duration: Duration) {
        let Some(i) = op_index(op) else {
            return;
        };
        let m = &self.ops[i];
        m.requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            m.errors.fetch_add(1, Ordering::Relaxed);
        }
        m.duration.observe(duration);
    }

    pub fn requests(&self, op: &str) -> u64 {
        op_index(op).map_or(0, |i| self.ops[i].requests.load(Ordering::Relaxed))
    }

    pub fn errors(&self, op: &str) -> u64 {
        op_index(op).map_or(0, |i| self.ops[i].errors.load(Ordering::Relaxed))
    }

    pub fn active_connections(&self) -> i64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, value));
        };
        counter(
            &mut out,
            "ldap_server_connections_total",
            "Total number of client connections accepted.",
            self.connections_total.load(Ordering::Relaxed),
        );
        out.push_str("# HELP ldap_server_connections_active Client connections currently open.\n");
        out.push_str("# TYPE ldap_server_connections_active gauge\n");
        out.push_str(&format!("ldap_server_connections_active {}\n", self.active_connections()));
        counter(
            &mut out,
            "ldap_server_protocol_errors_total",
            "Connections dropped for malformed BER or LDAPMessage structure.",
            self.protocol_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ldap_server_abandoned_total",
            "Requests cancelled by abandon, a new bind or connection close.",
            self.abandoned.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ldap_server_start_tls_total",
            "Successful StartTLS upgrades.",
            self.start_tls.load(Ordering::Relaxed),
        );

        out.push_str("# HELP ldap_server_requests_total Completed LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_server_requests_total counter\n");
        for (op, m) in OPERATIONS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "ldap_server_requests_total{{op=\"{}\"}} {}\n",
                op,
                m.requests.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_server_errors_total Requests answered with an error result code.\n");
        out.push_str("# TYPE ldap_server_errors_total counter\n");
        for (op, m) in OPERATIONS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "ldap_server_errors_total{{op=\"{}\"}} {}\n",
                op,
                m.errors.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_server_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_server_request_duration_seconds histogram\n");
        for (op, m) in OPERATIONS.iter().zip(&self.ops) {
            let hist = &m.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_server_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_server_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_server_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_server_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    connections: i64,
}

/// Path from the first line of an HTTP request ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

fn route(path: &str, metrics: &Metrics, ready: bool) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/ready" => {
            let body = serde_json::to_string(&ReadyBody {
                ready,
                connections: metrics.active_connections(),
            })
            .unwrap_or_else(|_| r#"{"ready":false}"#.to_string());
            let status = if ready { "200 OK" } else { "503 Service Unavailable" };
            (status, body, "application/json")
        }
        "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}

/// Serve GET /metrics, /health (liveness) and /ready (200 once `ready`
/// reports true, else 503).
pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<Metrics>,
    ready: Arc<dyn Fn() -> bool + Send + Sync>,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let (status, body, content_type) = route(path, &metrics, ready());
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
