//! Per-request context handed to route handlers and middleware.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::Request;

/// Header used to correlate a request across logs and the response.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Per-request context: the parsed request plus a correlation id.
///
/// The id is taken from an incoming `X-Request-Id` header when the client
/// sent one, and generated otherwise.
#[derive(Debug)]
pub struct Context {
    request: Request,
    request_id: String,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                format!("req-{:06x}", NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
            });
        Self {
            request,
            request_id,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Decode the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[test]
    fn request_id_is_echoed() {
        let ctx = Context::new(request(
            "POST /api/ask HTTP/1.1\r\nX-Request-Id: abc-123\r\n\r\n",
        ));
        assert_eq!(ctx.request_id(), "abc-123");
    }

    #[test]
    fn request_id_is_generated_when_absent() {
        let a = Context::new(request("GET / HTTP/1.1\r\n\r\n"));
        let b = Context::new(request("GET / HTTP/1.1\r\n\r\n"));
        assert!(a.request_id().starts_with("req-"));
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn json_body() {
        let ctx = Context::new(request(
            "POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n{\"prompt\":\"hey\"}\n",
        ));
        let value: serde_json::Value = ctx.json().unwrap();
        assert_eq!(value["prompt"], "hey");
    }
}
