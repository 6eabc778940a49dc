//! Request/response primitives shared by the pipeline, the plugins and the net layer.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use uuid::Uuid;

/// Identifies a single intercepted request for the lifetime of its pipeline pass.
///
/// Generated once at ingress and carried through both phases; it is also the key
/// under which per-request storage is allocated and released.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A body together with the content type it was produced or observed with.
///
/// Plugins that synthesize bodies (mocks, random-error payloads) build these
/// directly; bodies read off the wire keep whatever `Content-Type` was observed.
#[derive(Debug, Clone, Default)]
pub struct Body {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

impl Body {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            bytes: Bytes::from(s.into()),
            content_type: Some("text/plain".to_string()),
        }
    }

    pub fn json(value: &impl serde::Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            bytes: Bytes::from(serde_json::to_vec(value)?),
            content_type: Some("application/json".to_string()),
        })
    }

    pub fn bytes(bytes: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

/// A request as observed by the interception pipeline, before any plugin runs.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Body>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// The absolute URL string patterns are matched against.
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    pub fn host(&self) -> Option<String> {
        self.uri.host().map(str::to_string)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A response as produced by the upstream, a mock, or a plugin's own hand.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Body>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        if let Some(ct) = &body.content_type {
            if let Ok(value) = http::HeaderValue::from_str(ct) {
                self.headers.insert(http::header::CONTENT_TYPE, value);
            }
        }
        self.body = Some(body);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
