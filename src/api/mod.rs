//! Read-only HTTP surface over the trip ledger.
//!
//! This module is responsible for:
//! - serving count, statistics, trip summary and recent events as JSON
//! - refusing non-loopback peers when bound to loopback
//!
//! This module MUST NOT:
//! - mutate the ledger (the processing loop is its only writer)
//! - block the processing loop (it only takes short ledger snapshots)

use crate::trip::TripLedger;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApiServer {
    cfg: ApiConfig,
    ledger: TripLedger,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ledger: TripLedger) -> Self {
        Self { cfg, ledger }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api addr '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ledger = self.ledger;
        let join = std::thread::Builder::new()
            .name("counter-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ledger, shutdown_thread) {
                    log::error!("counter api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ledger: TripLedger, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &ledger) {
                    log::warn!("counter api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ledger: &TripLedger) -> Result<()> {
    // Accepted sockets may inherit nonblocking mode from the listener.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    let (status, body) = route(&request, ledger)?;
    write_response(&mut stream, status, "application/json", &body)
}

#[derive(Serialize)]
struct HealthBody<'a> {
    status: &'a str,
    trip_status: &'a str,
    passenger_count: u32,
}

fn route(request: &HttpRequest, ledger: &TripLedger) -> Result<(u16, Vec<u8>)> {
    if request.method != "GET" {
        return Ok((405, br#"{"error":"method_not_allowed"}"#.to_vec()));
    }
    let body = match request.path.as_str() {
        "/health" => {
            let trip = ledger.trip();
            serde_json::to_vec(&HealthBody {
                status: "ok",
                trip_status: trip.status().as_str(),
                passenger_count: trip.current_passenger_count(),
            })?
        }
        "/count" => serde_json::to_vec(&serde_json::json!({
            "passenger_count": ledger.current_count()
        }))?,
        "/stats" => serde_json::to_vec(&ledger.statistics())?,
        "/trip" => serde_json::to_vec(&ledger.summary())?,
        "/events" => {
            let limit = match request.query_param("limit") {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(n) => n.min(MAX_EVENT_LIMIT),
                    Err(_) => return Ok((400, br#"{"error":"invalid_limit"}"#.to_vec())),
                },
                None => DEFAULT_EVENT_LIMIT,
            };
            serde_json::to_vec(&ledger.recent_events(limit))?
        }
        _ => return Ok((404, br#"{"error":"not_found"}"#.to_vec())),
    };
    Ok((200, body))
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    HttpRequest::parse(&String::from_utf8_lossy(&data))
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    #[allow(dead_code)]
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn parse(text: &str) -> Result<Self> {
        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
        let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                headers.insert(k.trim().to_lowercase(), v.trim().to_string());
            }
        }
        let (path, query_str) = raw_path.split_once('?').unwrap_or((raw_path, ""));
        let query = query_str
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
            query,
        })
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CrossingKind;
    use serde_json::{Map, Value};

    fn get(path: &str) -> HttpRequest {
        HttpRequest::parse(&format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path)).unwrap()
    }

    fn ledger_with_passengers(n: usize) -> TripLedger {
        let ledger = TripLedger::new("taxi_dev_001", 4);
        for _ in 0..n {
            ledger
                .record_crossing(CrossingKind::Entry, Map::new())
                .unwrap();
        }
        ledger
    }

    #[test]
    fn parses_path_and_query() {
        let request = get("/events?limit=5&verbose");
        assert_eq!(request.path, "/events");
        assert_eq!(request.query_param("limit"), Some("5"));
        assert_eq!(request.query_param("verbose"), Some(""));
        assert_eq!(request.headers.get("host").map(String::as_str), Some("localhost"));
    }

    #[test]
    fn stats_reflect_the_ledger() {
        let ledger = ledger_with_passengers(2);
        let (status, body) = route(&get("/stats"), &ledger).unwrap();
        assert_eq!(status, 200);
        let stats: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["current_count"], 2);
        assert_eq!(stats["total_entries"], 2);
    }

    #[test]
    fn events_respect_limit() {
        let ledger = ledger_with_passengers(3);
        let (status, body) = route(&get("/events?limit=2"), &ledger).unwrap();
        assert_eq!(status, 200);
        let events: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(events.len(), 2);

        let (status, _) = route(&get("/events?limit=many"), &ledger).unwrap();
        assert_eq!(status, 400);
    }

    #[test]
    fn unknown_paths_and_methods_are_rejected() {
        let ledger = ledger_with_passengers(0);
        let (status, _) = route(&get("/admin"), &ledger).unwrap();
        assert_eq!(status, 404);
        let post = HttpRequest::parse("POST /stats HTTP/1.1\r\n\r\n").unwrap();
        let (status, _) = route(&post, &ledger).unwrap();
        assert_eq!(status, 405);
    }

    #[test]
    fn serves_over_loopback() {
        let ledger = ledger_with_passengers(1);
        let handle = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ledger,
        )
        .spawn()
        .unwrap();

        let mut stream = TcpStream::connect(handle.addr).unwrap();
        stream
            .write_all(b"GET /count HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with(r#"{"passenger_count":1}"#));

        handle.stop().unwrap();
    }
}
