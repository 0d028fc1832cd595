//! Transport layer abstraction for remote requests.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `HEAD`
    Head,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Path relative to the remote's base URL.
    pub path: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Option<Vec<u8>>,
    /// Deadline the transport should honor.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(15),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a JSON body.
    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self.with_header("content-type", "application/json")
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the first header with `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response from the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with an empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// Creates a response carrying a JSON body.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns true for a 5xx status.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Sends requests to the remote authority.
///
/// Implementations return `Ok` for every response the remote produced,
/// whatever its status. Transport-level failures map to
/// [`SyncError::TransientNetwork`], and a fired `cancel` token to
/// [`SyncError::Cancelled`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request.
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> SyncResult<HttpResponse>;
}

/// A scripted transport for testing.
///
/// Each `(method, path)` route answers from a queue of one-shot responses,
/// then from a sticky response. Routes with neither answer
/// `default_status`. Every request is logged.
#[derive(Debug)]
pub struct MockTransport {
    online: AtomicBool,
    default_status: u16,
    latency: Mutex<Option<Duration>>,
    once: Mutex<HashMap<(HttpMethod, String), VecDeque<HttpResponse>>>,
    sticky: Mutex<HashMap<(HttpMethod, String), HttpResponse>>,
    log: Mutex<Vec<HttpRequest>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates an online transport that answers 200 to everything.
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            default_status: 200,
            latency: Mutex::new(None),
            once: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Sets whether the network is reachable.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delays every response.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Queues a one-shot response for a route.
    pub fn push_response(&self, method: HttpMethod, path: impl Into<String>, response: HttpResponse) {
        self.once
            .lock()
            .entry((method, path.into()))
            .or_default()
            .push_back(response);
    }

    /// Sets the response a route returns once its one-shot queue is empty.
    pub fn set_response(&self, method: HttpMethod, path: impl Into<String>, response: HttpResponse) {
        self.sticky.lock().insert((method, path.into()), response);
    }

    /// Returns every request sent so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().clone()
    }

    /// Returns the requests sent to one route.
    pub fn requests_to(&self, method: HttpMethod, path: &str) -> Vec<HttpRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    /// Forgets logged requests.
    pub fn clear_requests(&self) {
        self.log.lock().clear();
    }

    fn respond(&self, method: HttpMethod, path: &str) -> HttpResponse {
        let key = (method, path.to_string());
        if let Some(response) = self.once.lock().get_mut(&key).and_then(VecDeque::pop_front) {
            return response;
        }
        self.sticky
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(self.default_status))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> SyncResult<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.log.lock().push(request.clone());

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::TransientNetwork("network unreachable".into()));
        }
        Ok(self.respond(request.method, &request.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses() {
        let transport = MockTransport::new();
        transport.push_response(HttpMethod::Post, "/a", HttpResponse::new(409));
        transport.set_response(HttpMethod::Post, "/a", HttpResponse::new(201));
        let cancel = CancellationToken::new();

        let mut statuses = Vec::new();
        for path in ["/a", "/a", "/a", "/b"] {
            let request = HttpRequest::new(HttpMethod::Post, path);
            statuses.push(transport.send(request, &cancel).await.unwrap().status);
        }
        assert_eq!(statuses, vec![409, 201, 201, 200]);

        assert_eq!(transport.requests().len(), 4);
        assert_eq!(transport.requests_to(HttpMethod::Post, "/a").len(), 3);
    }

    #[tokio::test]
    async fn offline_is_a_transient_error() {
        let transport = MockTransport::new();
        transport.set_online(false);

        let result = transport
            .send(HttpRequest::new(HttpMethod::Head, "/api/health"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SyncError::TransientNetwork(_))));
    }

    #[tokio::test]
    async fn cancelled_requests_are_not_sent() {
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transport.send(HttpRequest::new(HttpMethod::Get, "/x"), &cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn request_headers() {
        let request = HttpRequest::new(HttpMethod::Put, "/x")
            .with_json_body(b"{}".to_vec())
            .with_header("Authorization", "Bearer t");
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("authorization"), Some("Bearer t"));
        assert_eq!(request.header("x-missing"), None);
    }
}
