// mitm_injector::response
//
// The per-response value the proxy engine hands to the pipeline.  Headers
// live in an `http::HeaderMap`, so every lookup is case-insensitive.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderMap;

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub host: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The `Content-Type` header, or an empty string when it is missing or
    /// not valid header text.
    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}
