//! JSON-over-HTTP observability surface.
//!
//! One request per connection, `Connection: close`, no keep-alive. Routing is
//! [`route`], a pure function over the pipeline, so the table can be tested
//! without sockets.
//!
//! | Method | Path                          | Body                         |
//! |--------|-------------------------------|------------------------------|
//! | GET    | `/health`                     | `{"status":"ok"}`            |
//! | GET    | `/telemetry/metrics`          | metric window, oldest first  |
//! | GET    | `/telemetry/traces?limit=N`   | trace log, newest first      |
//! | GET    | `/edge/status`                | `BufferStatus`               |
//! | POST   | `/edge/toggle`                | `{"isConnected": bool}`      |
//! | POST   | `/edge/simulate?bursts=N`     | `SimulationReport`, N <= 100 |
//! | GET    | `/ratelimit/status/{tenant}`  | `TokenBucket` plus `max`     |
//! | GET    | `/dashboard?tenant=ID`        | `DashboardSnapshot`          |

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::pipeline::Pipeline;
use crate::tenant::TenantDirectory;

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_HEADERS: usize = 32;
const DASHBOARD_TRACES: usize = 20;

/// Upper bound on `bursts` for `POST /edge/simulate`; the simulation runs
/// inline on the connection task.
pub const MAX_SIMULATE_BURSTS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Self { status, body: json!({ "error": message }) }
    }

    fn json<T: serde::Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self::ok(body),
            Err(e) => Self::error(500, &e.to_string()),
        }
    }

    /// Full HTTP/1.1 response bytes.
    pub fn to_http(&self) -> String {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Connection: close\r\n\r\n{}",
            self.status,
            reason_phrase(self.status),
            body.len(),
            body
        )
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

/// Percent-decoding for query values and path segments.
pub fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex: Vec<u8> = iter.by_ref().take(2).collect();
                let decoded = std::str::from_utf8(&hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                if let Some(byte) = decoded {
                    bytes.push(byte);
                }
            }
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((key.to_string(), url_decode(val)))
        })
        .collect()
}

/// Dispatch one request. `target` is the raw request target, query included.
pub fn route(pipeline: &Pipeline, method: &str, target: &str) -> Response {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let query = parse_query(query);
    let path = path.trim_end_matches('/');

    if let Some(tenant) = path.strip_prefix("/ratelimit/status/") {
        let tenant = url_decode(tenant);
        if tenant.is_empty() || tenant.contains('/') {
            return Response::error(404, "Not Found");
        }
        if method != "GET" {
            return Response::error(405, "Method Not Allowed");
        }
        let bucket = pipeline.limiter.status(&tenant);
        let mut body = json!(bucket);
        body["tenantId"] = json!(tenant);
        body["max"] = json!(pipeline.tenants.rate_limit_per_minute(&tenant));
        return Response::ok(body);
    }

    match (method, path) {
        ("GET", "/health") => Response::ok(json!({ "status": "ok" })),
        ("GET", "/telemetry/metrics") => Response::json(&pipeline.telemetry.metrics()),
        ("GET", "/telemetry/traces") => {
            let mut traces = pipeline.telemetry.recent_traces();
            match query.get("limit").map(|l| l.parse::<usize>()) {
                Some(Ok(limit)) => traces.truncate(limit),
                Some(Err(_)) => {
                    return Response::error(400, "limit must be a non-negative integer");
                }
                None => {}
            }
            Response::json(&traces)
        }
        ("GET", "/edge/status") => Response::json(&pipeline.edge.status()),
        ("POST", "/edge/toggle") => {
            let connected = pipeline.edge.toggle_connection();
            Response::ok(json!({ "isConnected": connected }))
        }
        ("POST", "/edge/simulate") => {
            let bursts = match query.get("bursts").map(|b| b.parse::<usize>()) {
                Some(Ok(b)) if b <= MAX_SIMULATE_BURSTS => b,
                Some(_) => {
                    return Response::error(400, "bursts must be an integer between 0 and 100");
                }
                None => 1,
            };
            Response::json(&pipeline.simulate_load(bursts))
        }
        ("GET", "/dashboard") => {
            let tenant = query
                .get("tenant")
                .map(String::as_str)
                .unwrap_or_else(|| pipeline.default_tenant());
            Response::json(&pipeline.snapshot(tenant, DASHBOARD_TRACES))
        }
        (
            _,
            "/health" | "/telemetry/metrics" | "/telemetry/traces" | "/edge/status" | "/edge/toggle"
            | "/edge/simulate" | "/dashboard",
        ) => Response::error(405, "Method Not Allowed"),
        _ => Response::error(404, "Not Found"),
    }
}

/// Accept connections until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Observability server listening");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &pipeline).await {
                        tracing::debug!(%peer, error = %e, "Connection error");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Observability server stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Read one request head, answer it, close.
async fn handle_connection(mut stream: TcpStream, pipeline: &Pipeline) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let (method, target) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let method = req.method.unwrap_or("GET").to_string();
                let target = req.path.unwrap_or("/").to_string();
                break (method, target);
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_REQUEST_BYTES => continue,
            Ok(httparse::Status::Partial) => {
                let resp = Response::error(413, "request head too large");
                return stream.write_all(resp.to_http().as_bytes()).await;
            }
            Err(e) => {
                let resp = Response::error(400, &e.to_string());
                return stream.write_all(resp.to_http().as_bytes()).await;
            }
        }
    };

    let response = route(pipeline, &method, &target);
    tracing::debug!(%method, %target, status = response.status, "Request served");
    stream.write_all(response.to_http().as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PipelineConfig;
    use crate::edge::SimulatedUplink;
    use rstest::rstest;
    use std::time::Duration;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            &PipelineConfig::default(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Arc::new(SimulatedUplink::new(Duration::ZERO)),
        )
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("a%20b"), "a b");
        assert_eq!(url_decode("caf%C3%A9"), "café");
        assert_eq!(url_decode("plain"), "plain");
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("limit=5&tenant=mid-mfg&flag");
        assert_eq!(q["limit"], "5");
        assert_eq!(q["tenant"], "mid-mfg");
        assert_eq!(q["flag"], "");
        assert!(parse_query("").is_empty());
    }

    #[rstest]
    #[case("GET", "/health", 200)]
    #[case("GET", "/telemetry/metrics", 200)]
    #[case("GET", "/telemetry/traces", 200)]
    #[case("GET", "/telemetry/traces?limit=x", 400)]
    #[case("GET", "/edge/status", 200)]
    #[case("GET", "/edge/status/", 200)]
    #[case("POST", "/edge/toggle", 200)]
    #[case("GET", "/edge/toggle", 405)]
    #[case("POST", "/health", 405)]
    #[case("POST", "/edge/simulate?bursts=0", 200)]
    #[case("POST", "/edge/simulate?bursts=100", 200)]
    #[case("POST", "/edge/simulate?bursts=101", 400)]
    #[case("POST", "/edge/simulate?bursts=18446744073709551615", 400)]
    #[case("POST", "/edge/simulate?bursts=-1", 400)]
    #[case("GET", "/ratelimit/status/mid-mfg", 200)]
    #[case("DELETE", "/ratelimit/status/mid-mfg", 405)]
    #[case("GET", "/ratelimit/status/", 404)]
    #[case("GET", "/nope", 404)]
    fn test_route_status_codes(#[case] method: &str, #[case] target: &str, #[case] status: u16) {
        assert_eq!(route(&pipeline(), method, target).status, status);
    }

    #[test]
    fn test_toggle_flips_connection() {
        let p = pipeline();
        assert_eq!(route(&p, "POST", "/edge/toggle").body["isConnected"], false);
        assert_eq!(route(&p, "GET", "/edge/status").body["isConnected"], false);
        assert_eq!(route(&p, "POST", "/edge/toggle").body["isConnected"], true);
    }

    #[test]
    fn test_ratelimit_status_reports_max_without_consuming() {
        let p = pipeline();
        for _ in 0..2 {
            let body = route(&p, "GET", "/ratelimit/status/basic-01").body;
            assert_eq!(body["tokens"], 20.0);
            assert_eq!(body["max"], 20);
            assert_eq!(body["tenantId"], "basic-01");
        }
    }

    #[test]
    fn test_unknown_tenant_gets_default_limit() {
        let body = route(&pipeline(), "GET", "/ratelimit/status/who").body;
        assert_eq!(body["max"], 60);
    }

    #[test]
    fn test_simulate_then_traces_limit() {
        let p = pipeline();
        let body = route(&p, "POST", "/edge/simulate").body;
        assert_eq!(body["accepted"], 50);
        let traces = route(&p, "GET", "/telemetry/traces?limit=5").body;
        assert_eq!(traces.as_array().map(Vec::len), Some(5));
        assert_eq!(traces[0]["operation"], "packet_gen");
        assert_eq!(route(&p, "GET", "/edge/status").body["used"], 50);
    }

    #[test]
    fn test_oversized_simulation_rejected_before_any_work() {
        let p = pipeline();
        let resp = route(&p, "POST", "/edge/simulate?bursts=101");
        assert_eq!(resp.status, 400);
        assert!(resp.body["error"].as_str().unwrap().contains("bursts"));
        assert_eq!(p.edge.status().used, 0);
        assert_eq!(p.telemetry.trace_count(), 0);
    }

    #[test]
    fn test_dashboard_defaults_to_configured_tenant() {
        let body = route(&pipeline(), "GET", "/dashboard").body;
        assert_eq!(body["tenantId"], "enterprise-01");
        assert_eq!(body["rateLimitMax"], 1000);
    }

    #[test]
    fn test_to_http_has_length_and_close() {
        let http = Response::ok(json!({ "a": 1 })).to_http();
        assert!(http.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(http.contains("Content-Length: 7\r\n"));
        assert!(http.contains("Connection: close\r\n"));
        assert!(http.ends_with("{\"a\":1}"));
    }

    async fn request(addr: std::net::SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_serve_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::new(pipeline()), rx));

        let resp = request(addr, "GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.ends_with("{\"status\":\"ok\"}"));

        let resp = request(addr, "GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 404 Not Found"));

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), server).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, Arc::new(pipeline()), rx));

        let resp = request(addr, "\x01\x02 nonsense\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request"));
    }
}
