// mock_http_server: A scripted HTTP/1.1 server for exercising real clients.
//
// Binds 127.0.0.1:0, answers each request from a per-path route table and
// records what it received. Every response closes its connection, so a
// response can end early, stall, or omit its length the way a flaky backend
// would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the server answers one route.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    content_length: bool,
    cut_after: Option<usize>,
    stall_after: Option<usize>,
}

impl MockResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "application/octet-stream",
            body: body.into(),
            content_length: true,
            cut_after: None,
            stall_after: None,
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            content_type: "application/json",
            ..Self::status(status, value.to_string())
        }
    }

    /// Delimit the body by closing the connection instead.
    pub fn without_content_length(mut self) -> Self {
        self.content_length = false;
        self
    }

    /// Announce the full length but close after `n` body bytes.
    pub fn close_after(mut self, n: usize) -> Self {
        self.cut_after = Some(n);
        self
    }

    /// Send `n` body bytes, then keep the connection open without sending
    /// anything else.
    pub fn stall_after(mut self, n: usize) -> Self {
        self.stall_after = Some(n);
        self
    }
}

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct State {
    routes: HashMap<String, MockResponse>,
    requests: Vec<RecordedRequest>,
}

/// A mock HTTP server for integration testing.
///
/// Binds to port 0 and exposes the bound address. Unrouted paths get a
/// `404`; routes can be changed while the server runs.
pub struct MockHttpServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockHttpServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(State::default()));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, shared).await;
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn route(&self, path: &str, response: MockResponse) {
        lock(&self.state).routes.insert(path.to_owned(), response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, state: Arc<Mutex<State>>) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                // Client-side drops are expected in tests.
                let _ = Self::handle_connection(stream, state).await;
            });
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        state: Arc<Mutex<State>>,
    ) -> std::io::Result<()> {
        let Some(request) = read_request(&mut stream).await? else {
            return Ok(());
        };
        let route = request.path.split('?').next().unwrap_or_default().to_owned();
        let response = {
            let mut state = lock(&state);
            state.requests.push(request);
            state.routes.get(&route).cloned()
        }
        .unwrap_or_else(|| MockResponse::status(404, "not found"));

        let mut head = format!(
            "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Type: {}\r\n",
            response.status,
            reason(response.status),
            response.content_type
        );
        if response.content_length {
            head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes()).await?;

        let limit = response
            .cut_after
            .or(response.stall_after)
            .unwrap_or(response.body.len())
            .min(response.body.len());
        stream.write_all(&response.body[..limit]).await?;
        stream.flush().await?;

        if response.stall_after.is_some() {
            std::future::pending::<()>().await;
        }
        stream.shutdown().await
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Read one request: head up to the blank line, then `Content-Length` bytes.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<RecordedRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_owned();
    let path = request_line.next().unwrap_or_default().to_owned();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect();

    let body_len = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < body_len {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(body_len);

    Ok(Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    }))
}
