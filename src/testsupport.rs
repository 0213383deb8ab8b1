//! Test doubles for the remote SensorThings endpoints.
//!
//! A minimal HTTP/1.1 server on a loopback port, answering the two paths
//! the spooler talks to: anything under `/auth` as the login endpoint and
//! everything else as `CreateObservations`. Responses are scripted per
//! test; every request is recorded for assertions.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;

/// One request as seen by the mock server.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) path: String,
    pub(crate) authorization: Option<String>,
    pub(crate) body: String,
}

struct MockState {
    auth_responses: Mutex<VecDeque<(u16, String)>>,
    create_responses: Mutex<VecDeque<(u16, String)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    login_count: AtomicUsize,
    create_count: AtomicUsize,
}

/// Scripted SensorThings endpoint pair on an ephemeral loopback port.
///
/// Login requests pop from the auth script, defaulting to HTTP 200 with a
/// fresh `token-N` body so successive logins are distinguishable. Create
/// requests pop from the create script, defaulting to HTTP 201 `[]`.
pub(crate) struct MockSta {
    addr: SocketAddr,
    state: Arc<MockState>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockSta {
    pub(crate) async fn start(create_responses: Vec<(u16, String)>) -> Self {
        Self::start_with(Vec::new(), create_responses).await
    }

    pub(crate) async fn start_with(
        auth_responses: Vec<(u16, String)>,
        create_responses: Vec<(u16, String)>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock listener address");

        let state = Arc::new(MockState {
            auth_responses: Mutex::new(auth_responses.into_iter().collect()),
            create_responses: Mutex::new(create_responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            login_count: AtomicUsize::new(0),
            create_count: AtomicUsize::new(0),
        });

        let handle = tokio::spawn(serve(listener, Arc::clone(&state)));

        Self {
            addr,
            state,
            handle,
        }
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn auth_url(&self) -> String {
        format!("{}/auth/login", self.base_url())
    }

    pub(crate) fn create_url(&self) -> String {
        format!("{}/CreateObservations", self.base_url())
    }

    /// A config pointed at this mock, with defaults everywhere else.
    pub(crate) fn config(&self) -> Config {
        Config {
            base_url: self.base_url(),
            create_url: self.create_url(),
            auth_url: self.auth_url(),
            ..Config::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub(crate) fn create_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !r.path.starts_with("/auth"))
            .collect()
    }

    pub(crate) fn login_count(&self) -> usize {
        self.state.login_count.load(Ordering::SeqCst)
    }

    pub(crate) fn create_count(&self) -> usize {
        self.state.create_count.load(Ordering::SeqCst)
    }
}

impl Drop for MockSta {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(listener: TcpListener, state: Arc<MockState>) {
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let Some(request) = read_request(&mut stream).await else {
                return;
            };

            let is_auth = request.path.starts_with("/auth");
            state.requests.lock().unwrap().push(request);

            let (code, body) = if is_auth {
                let n = state.login_count.fetch_add(1, Ordering::SeqCst) + 1;
                state
                    .auth_responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| (200, format!(r#"{{"token":"token-{}"}}"#, n)))
            } else {
                state.create_count.fetch_add(1, Ordering::SeqCst);
                state
                    .create_responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| (201, "[]".to_string()))
            };

            write_response(&mut stream, code, &body).await;
        });
    }
}

/// Read one HTTP/1.1 request: header block, then a Content-Length body.
async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > 1_048_576 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let path = request_line.split_whitespace().nth(1)?.to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().unwrap_or(0),
                "authorization" => authorization = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Some(RecordedRequest {
        path,
        authorization,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

async fn write_response(stream: &mut TcpStream, code: u16, body: &str) {
    let reason = match code {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}
