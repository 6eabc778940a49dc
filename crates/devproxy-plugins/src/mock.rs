//! Mock-response engine.
//!
//! Matches intercepted requests against a loaded mock catalog, in
//! registration order, and synthesizes a response rather than forwarding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use devproxy_config::{MockEntry, MockFile, MockResponseSpec};
use devproxy_core::{Body, HookContext, Plugin, PluginError, Request, RequestOutcome, Response};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use regex::Regex;

pub struct MockEngine {
    name: String,
    mocks_dir: PathBuf,
    entries: Vec<CompiledMock>,
    block_unmocked: bool,
    batch_pattern: Option<Regex>,
    /// per-URL nth counters, monotonically increasing for the process lifetime.
    counters: Mutex<HashMap<String, u32>>,
}

struct CompiledMock {
    method: Method,
    url_exact: Option<String>,
    url_glob: Option<Regex>,
    body_fragment: Option<String>,
    nth: Option<u32>,
    response: MockResponseSpec,
}

impl MockEngine {
    pub fn new(name: impl Into<String>, mocks_file_path: impl AsRef<Path>, file: MockFile, block_unmocked: bool, batch_endpoint: Option<&str>) -> Result<Self, devproxy_core::ProxyError> {
        let mocks_dir = mocks_file_path
            .as_ref()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut entries = Vec::with_capacity(file.mocks.len());
        for mock in file.mocks {
            entries.push(compile_mock(mock)?);
        }

        let batch_pattern = batch_endpoint
            .map(|p| Regex::new(&format!("(?i)^{}$", devproxy_core::wildcard_to_regex(p))))
            .transpose()
            .map_err(|e| devproxy_core::ProxyError::InvalidWatchPattern(batch_endpoint.unwrap_or_default().to_string(), e))?;

        Ok(Self {
            name: name.into(),
            mocks_dir,
            entries,
            block_unmocked,
            batch_pattern,
            counters: Mutex::new(HashMap::new()),
        })
    }

    fn find_match(&self, request: &Request) -> Option<&CompiledMock> {
        let url = request.url();
        let body = request.body.as_ref().and_then(|b| b.as_str());

        for entry in &self.entries {
            if entry.method != request.method {
                continue;
            }
            let url_matches = match (&entry.url_exact, &entry.url_glob) {
                (Some(exact), _) => exact == &url,
                (None, Some(glob)) => glob.is_match(&url),
                (None, None) => false,
            };
            if !url_matches {
                continue;
            }
            if let Some(fragment) = &entry.body_fragment {
                let found = body
                    .map(|b| b.to_lowercase().contains(&fragment.to_lowercase()))
                    .unwrap_or(false);
                if !found {
                    continue;
                }
            }
            if let Some(n) = entry.nth {
                let mut counters = self.counters.lock();
                let count = counters.entry(url.clone()).or_insert(0);
                *count += 1;
                if *count != n {
                    continue;
                }
            }
            return Some(entry);
        }
        None
    }

    fn build_response(&self, spec: &MockResponseSpec) -> Response {
        let status = spec
            .status_code
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::OK);
        let mut response = Response::new(status);

        if let Some(headers) = &spec.headers {
            for (k, v) in headers {
                response = response.with_header(k, v);
            }
        }

        if let Some(body_value) = &spec.body {
            let body = self.resolve_body(body_value);
            response = response.with_body(body);
        }
        if response.headers.get(http::header::CONTENT_TYPE).is_none() {
            response = response.with_header("content-type", "application/json");
        }
        response
    }

    /// Resolves an inline JSON body, or an `@<path>`-token body read verbatim
    /// from disk relative to the mocks file's own directory.
    fn resolve_body(&self, value: &serde_json::Value) -> Body {
        if let serde_json::Value::String(s) = value {
            if let Some(rel_path) = s.strip_prefix('@') {
                let full_path = self.mocks_dir.join(rel_path);
                return match std::fs::read(&full_path) {
                    Ok(bytes) => Body::bytes(bytes, guess_content_type(&full_path)),
                    Err(e) => {
                        tracing::error!(path = %full_path.display(), error = %e, "mock @file dereference failed");
                        Body::text(s.clone())
                    }
                };
            }
        }
        Body::json(value).unwrap_or_else(|_| Body::text(value.to_string()))
    }
}

fn guess_content_type(path: &Path) -> Option<String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Some("application/json".to_string()),
        Some("txt") => Some("text/plain".to_string()),
        Some("html") => Some("text/html".to_string()),
        _ => Some("application/octet-stream".to_string()),
    }
}

fn compile_mock(entry: MockEntry) -> Result<CompiledMock, devproxy_core::ProxyError> {
    let method: Method = entry
        .request
        .method
        .parse()
        .map_err(|_| devproxy_core::ProxyError::ConfigInvalid(format!("invalid mock method `{}`", entry.request.method)))?;

    let (url_exact, url_glob) = if entry.request.url.contains('*') {
        let src = format!("(?i)^{}$", devproxy_core::wildcard_to_regex(&entry.request.url));
        let re = Regex::new(&src).map_err(|e| devproxy_core::ProxyError::InvalidWatchPattern(entry.request.url.clone(), e))?;
        (None, Some(re))
    } else {
        (Some(entry.request.url.clone()), None)
    };

    Ok(CompiledMock {
        method,
        url_exact,
        url_glob,
        body_fragment: entry.request.body_fragment,
        nth: entry.request.nth,
        response: entry.response,
    })
}

#[async_trait]
impl Plugin for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, request: &Request, _ctx: &HookContext<'_>) -> Result<RequestOutcome, PluginError> {
        if let Some(batch_re) = &self.batch_pattern {
            if batch_re.is_match(&request.url()) {
                return Ok(RequestOutcome::Respond(self.handle_batch(request)?));
            }
        }

        if let Some(entry) = self.find_match(request) {
            let response = self.build_response(&entry.response);
            return Ok(RequestOutcome::Respond(response));
        }

        if self.block_unmocked {
            let body = serde_json::json!({
                "error": format!("No mock found for {} {}", request.method, request.url()),
            });
            return Ok(RequestOutcome::Respond(
                Response::new(StatusCode::BAD_GATEWAY).with_body(Body::json(&body).unwrap()),
            ));
        }

        Ok(RequestOutcome::Continue)
    }
}

impl MockEngine {
    fn handle_batch(&self, request: &Request) -> Result<Response, PluginError> {
        #[derive(serde::Deserialize)]
        struct BatchRequest {
            id: String,
            method: String,
            url: String,
            #[serde(default)]
            body: Option<serde_json::Value>,
        }
        #[derive(serde::Deserialize)]
        struct BatchEnvelope {
            requests: Vec<BatchRequest>,
        }
        #[derive(serde::Serialize)]
        struct BatchResponseItem {
            id: String,
            status: u16,
            #[serde(skip_serializing_if = "Option::is_none")]
            body: Option<serde_json::Value>,
        }
        #[derive(serde::Serialize)]
        struct BatchResponseEnvelope {
            responses: Vec<BatchResponseItem>,
        }

        let raw = request.body.as_ref().and_then(|b| b.as_str()).unwrap_or("{}");
        let envelope: BatchEnvelope = serde_json::from_str(raw).map_err(|e| PluginError::msg(format!("invalid batch body: {e}")))?;

        let mut responses = Vec::with_capacity(envelope.requests.len());
        for sub in envelope.requests {
            let method: Method = sub.method.parse().unwrap_or(Method::GET);
            let sub_req = Request {
                method,
                uri: sub.url.parse().unwrap_or_else(|_| "/".parse().unwrap()),
                headers: http::HeaderMap::new(),
                body: sub.body.as_ref().map(|b| Body::json(b).unwrap()),
            };
            match self.find_match(&sub_req) {
                Some(entry) => {
                    let body = entry.response.body.clone();
                    responses.push(BatchResponseItem {
                        id: sub.id,
                        status: entry.response.status_code.unwrap_or(200),
                        body,
                    });
                }
                None => responses.push(BatchResponseItem {
                    id: sub.id,
                    status: 502,
                    body: None,
                }),
            }
        }

        let envelope = BatchResponseEnvelope { responses };
        Ok(Response::new(StatusCode::OK).with_body(Body::json(&envelope).map_err(|e| PluginError::msg(e.to_string()))?))
    }
}

pub type SharedMockEngine = Arc<MockEngine>;

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_config::{MockRequestMatcher, MockResponseSpec};
    use devproxy_core::{GlobalStore, PerRequestStore, RequestId};

    fn ctx<'a>(id: &'a RequestId, global: &'a GlobalStore, per_request: &'a PerRequestStore) -> HookContext<'a> {
        HookContext {
            request_id: id,
            global,
            per_request,
        }
    }

    fn file_with(entries: Vec<MockEntry>) -> MockFile {
        MockFile { schema: None, mocks: entries }
    }

    fn get_request(url: &str) -> Request {
        Request::new(Method::GET, url.parse().unwrap())
    }

    #[tokio::test]
    async fn nth_qualifier_only_matches_the_nth_occurrence() {
        let file = file_with(vec![MockEntry {
            request: MockRequestMatcher {
                method: "GET".to_string(),
                url: "https://api/x".to_string(),
                body_fragment: None,
                nth: Some(2),
            },
            response: MockResponseSpec {
                status_code: Some(200),
                headers: None,
                body: Some(serde_json::json!({"v": "second"})),
            },
        }]);
        let engine = MockEngine::new("mock-response", "/mocks/mocks.json", file, false, None).unwrap();

        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let hctx = ctx(&id, &global, &per_request);

        let first = engine.on_request(&get_request("https://api/x"), &hctx).await.unwrap();
        assert!(matches!(first, RequestOutcome::Continue));

        let second = engine.on_request(&get_request("https://api/x"), &hctx).await.unwrap();
        match second {
            RequestOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::OK),
            _ => panic!("expected the second call to match nth=2"),
        }

        let third = engine.on_request(&get_request("https://api/x"), &hctx).await.unwrap();
        assert!(matches!(third, RequestOutcome::Continue));
    }

    #[tokio::test]
    async fn block_unmocked_synthesizes_502() {
        let engine = MockEngine::new("mock-response", "/mocks/mocks.json", file_with(vec![]), true, None).unwrap();
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let hctx = ctx(&id, &global, &per_request);

        match engine.on_request(&get_request("https://api/unmatched"), &hctx).await.unwrap() {
            RequestOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::BAD_GATEWAY),
            _ => panic!("expected a synthesized 502"),
        }
    }
}
