//! Request and response envelopes exchanged with the shell.
//!
//! Bodies are lazy byte streams end to end: resolvers hand back a stream
//! handle and the dispatcher may compose or transform it, but never buffers
//! a whole body unless a component explicitly needs to (the hyper drive-key
//! interceptor is the one such place).

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::Error;
use crate::error::Result;

/// A lazy, possibly unbounded response or upload body.
pub type Body = BoxStream<'static, Result<Bytes>>;

/// An empty body.
pub fn empty_body() -> Body {
    stream::empty().boxed()
}

/// A single-chunk body.
pub fn body_from_bytes(bytes: impl Into<Bytes>) -> Body {
    let bytes = bytes.into();
    stream::once(async move { Ok(bytes) }).boxed()
}

/// Source of one multipart form part's payload.
#[derive(Debug, Clone)]
pub enum PartBody {
    /// Inline bytes.
    Bytes(Bytes),
    /// A file on the local filesystem.
    File(PathBuf),
    /// A blob held by the shell, referenced by UUID.
    Blob(String),
}

/// One part of a multipart form upload.
#[derive(Debug, Clone, Default)]
pub struct MultipartPart {
    /// File name from the part headers.
    pub filename: Option<String>,
    /// Mime type from the part headers.
    pub mime: Option<String>,
    /// Payload. `None` when the transport splits metadata from payload;
    /// the following blob part then carries the bytes.
    pub body: Option<PartBody>,
}

/// Upload payload attached to a request.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Raw bytes.
    Bytes(Bytes),
    /// A file or directory on the local filesystem.
    File(PathBuf),
    /// A blob held by the shell, referenced by UUID.
    Blob(String),
    /// A multipart form.
    MultipartForm(Vec<MultipartPart>),
}

/// Resolver for shell-held blobs referenced by UUID.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the bytes of blob `uuid`.
    async fn get(&self, uuid: &str) -> Result<Bytes>;
}

/// An incoming navigation or fetch request.
#[derive(Debug)]
pub struct Request {
    /// Full URL including scheme and query.
    pub url: String,
    /// HTTP method name, uppercase.
    pub method: String,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Upload payload, when the method carries one.
    pub upload: Option<UploadSource>,
}

impl Request {
    /// A bare GET request for `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: vec![],
            upload: None,
        }
    }

    /// Parse [Request::url], failing with [Error::MalformedUrl].
    pub fn parse_url(&self) -> Result<url::Url> {
        url::Url::parse(&self.url).map_err(|e| Error::MalformedUrl(format!("{}: {e}", self.url)))
    }
}

/// The response envelope handed back to the shell.
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Headers in insertion order.
    pub headers: Vec<(String, String)>,
    /// Lazy body.
    pub body: Body,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .finish()
    }
}

/// Standard headers carried by every successful gateway response.
pub fn standard_headers(content_type: &str) -> Vec<(String, String)> {
    vec![
        ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
        ("Allow-CSP-From".to_string(), "*".to_string()),
        ("Cache-Control".to_string(), "no-cache".to_string()),
        ("Content-Type".to_string(), content_type.to_string()),
    ]
}

impl Response {
    /// A streaming response with the standard header set.
    pub fn stream(status: u16, content_type: &str, body: Body) -> Self {
        Self {
            status,
            headers: standard_headers(content_type),
            body,
        }
    }

    /// A `text/html` response.
    pub fn html(status: u16, html: impl Into<Bytes>) -> Self {
        Self::stream(status, "text/html; charset=utf-8", body_from_bytes(html))
    }

    /// An `application/json` response from a serializable value.
    pub fn json<T: serde::Serialize>(status: u16, value: &T) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Self::stream(status, "application/json", body_from_bytes(bytes))
    }

    /// A `text/plain` response.
    pub fn text(status: u16, text: impl Into<Bytes>) -> Self {
        Self::stream(status, "text/plain; charset=utf-8", body_from_bytes(text))
    }

    /// The error envelope for `err`, `{"error": "..."}` with the mapped
    /// status code.
    pub fn from_error(err: &Error) -> Self {
        Self::json(
            err.status_code(),
            &serde_json::json!({ "error": err.to_string() }),
        )
    }

    /// Append a header, preserving order.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_headers_present() {
        let response = Response::html(200, "<html></html>");
        let names: Vec<_> = response.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"Access-Control-Allow-Origin"));
        assert!(names.contains(&"Allow-CSP-From"));
        assert!(names.contains(&"Cache-Control"));
        assert!(names.contains(&"Content-Type"));
    }

    #[test]
    fn test_response_debug_omits_body() {
        let response = Response::text(200, "ok");
        let debug = format!("{response:?}");
        assert!(debug.contains("status: 200"));
        assert!(debug.contains("<stream>"));
    }

    #[test]
    fn test_error_envelope_status() {
        let response = Response::from_error(&Error::RoomNotFound("abcd".to_string()));
        assert_eq!(response.status, 404);
    }
}
