//! Scripted HTTP server on a raw TcpListener, one response per connection.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use codegen_agent::config::{Config, ConfigOverrides};

/// Decides the raw HTTP response for the `n`th request (0-based).
pub type Handler = Arc<dyn Fn(usize, &str) -> String + Send + Sync>;

pub struct MockServer {
    pub port: u16,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, &str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let (h, r) = (hits.clone(), requests.clone());
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let (handler, hits, requests) = (handler.clone(), h.clone(), r.clone());
                tokio::spawn(async move {
                    serve_one(socket, handler, hits, requests).await;
                });
            }
        });

        Self {
            port,
            hits,
            requests,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Raw request text (head and body) in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_one(
    mut socket: TcpStream,
    handler: Handler,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let request = read_request(&mut socket).await;
    if request.is_empty() {
        return;
    }
    let n = hits.fetch_add(1, Ordering::SeqCst);
    requests.lock().unwrap().push(request.clone());

    let response = handler(n, &request);
    if response.is_empty() {
        // Hang without answering, to exercise client timeouts.
        tokio::time::sleep(Duration::from_secs(30)).await;
        return;
    }
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn json_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

pub fn ok(body: &str) -> String {
    json_response("200 OK", body)
}

/// Request line of a raw request, e.g. `GET /tasks/t1 HTTP/1.1`.
pub fn request_line(request: &str) -> &str {
    request.lines().next().unwrap_or_default()
}

/// Fast timings so retry and polling tests finish in milliseconds.
pub fn test_config(base_url: &str) -> Config {
    let mut config = Config::default();
    config.apply_overrides(ConfigOverrides {
        api_key: Some("test-token".into()),
        org_id: Some("org-1".into()),
        base_url: Some(base_url.to_string()),
        max_retries: Some(2),
        retry_delay: Some(Duration::from_millis(10)),
        polling_interval: Some(Duration::from_millis(20)),
        polling_timeout: Some(Duration::from_secs(5)),
        request_timeout: Some(Duration::from_secs(2)),
        circuit_breaker_threshold: Some(5),
        circuit_breaker_recovery_time: Some(Duration::from_secs(60)),
        ..Default::default()
    });
    config.max_retry_delay = Duration::from_millis(50);
    config.jitter_fraction = 0.0;
    config
}
