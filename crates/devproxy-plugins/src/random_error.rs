//! Random-error engine.
//!
//! Draws a uniform `[1, 100]` value and, if it lands at or under the
//! configured rate, fails the request with a status drawn from the method's
//! error catalog. See `DESIGN.md`'s Open Question #1 for why the draw is
//! `[1, 100]` inclusive rather than excluding 100.

use async_trait::async_trait;
use chrono::Utc;
use devproxy_config::{ErrorCatalogFile, RandomErrorConfig};
use devproxy_core::{Body, HookContext, Plugin, PluginError, Request, RequestOutcome, Response};
use http::{Method, StatusCode};
use rand::Rng;

fn default_catalog(method: &Method) -> &'static [u16] {
    match *method {
        Method::GET | Method::PATCH => &[429, 500, 502, 503, 504],
        Method::POST | Method::PUT | Method::DELETE => &[429, 500, 502, 503, 504, 507],
        _ => &[500, 502, 503, 504],
    }
}

/// Either the engine's built-in catalog (Microsoft Graph-shaped — every
/// status in it gets an `innerError` object) or a loaded `errorsFile`
/// override (generic `{code, message}` bodies — an arbitrary custom catalog
/// isn't assumed to belong to any particular provider).
enum Catalog {
    Default,
    Custom(Vec<devproxy_config::ErrorCatalogEntry>),
}

pub struct RandomErrorEngine {
    name: String,
    config: RandomErrorConfig,
    catalog: Catalog,
}

impl RandomErrorEngine {
    pub fn new(name: impl Into<String>, config: RandomErrorConfig, errors_file: Option<ErrorCatalogFile>) -> Self {
        let catalog = match errors_file {
            Some(file) => Catalog::Custom(file.errors),
            None => Catalog::Default,
        };
        Self { name: name.into(), config, catalog }
    }

    fn candidate_statuses(&self, method: &Method) -> Vec<u16> {
        let catalog: Vec<u16> = match &self.catalog {
            Catalog::Default => default_catalog(method).to_vec(),
            Catalog::Custom(entries) => entries
                .iter()
                .filter(|e| e.method == "*" || e.method.eq_ignore_ascii_case(method.as_str()))
                .flat_map(|e| e.statuses.iter().copied())
                .collect(),
        };
        if devproxy_config::is_present_and_nonempty(&self.config.allowed_errors) {
            let allowed = self.config.allowed_errors.as_ref().unwrap();
            catalog.into_iter().filter(|s| allowed.contains(s)).collect()
        } else {
            catalog
        }
    }

    fn error_body(&self, status: u16, request_id: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": {
                "code": status,
                "message": format!("A random error ({status}) was injected by dev-proxy"),
                "requestId": request_id,
                "timestamp": Utc::now().to_rfc3339(),
            }
        });
        if matches!(self.catalog, Catalog::Default) {
            body["error"]["innerError"] = serde_json::json!({
                "requestId": request_id,
                "date": Utc::now().to_rfc3339(),
            });
        }
        body
    }
}

#[async_trait]
impl Plugin for RandomErrorEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, request: &Request, ctx: &HookContext<'_>) -> Result<RequestOutcome, PluginError> {
        let candidates = self.candidate_statuses(&request.method);
        if candidates.is_empty() {
            return Ok(RequestOutcome::Continue);
        }

        let draw = rand::rng().random_range(1..=100u8);
        if draw > self.config.rate {
            return Ok(RequestOutcome::Continue);
        }

        let status = candidates[rand::rng().random_range(0..candidates.len())];
        let body = self.error_body(status, ctx.request_id.as_str());
        let status_code = StatusCode::from_u16(status).map_err(|e| PluginError::msg(e.to_string()))?;
        let mut response = Response::new(status_code).with_body(Body::json(&body).map_err(|e| PluginError::msg(e.to_string()))?);
        if status == 429 {
            response = response.with_header("Retry-After", self.config.retry_after_in_seconds.to_string());
        }
        Ok(RequestOutcome::Respond(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_core::{GlobalStore, PerRequestStore, RequestId};

    fn ctx<'a>(id: &'a RequestId, global: &'a GlobalStore, per_request: &'a PerRequestStore) -> HookContext<'a> {
        HookContext { request_id: id, global, per_request }
    }

    #[tokio::test]
    async fn rate_100_always_fails_with_a_catalog_status() {
        let engine = RandomErrorEngine::new(
            "random-error",
            RandomErrorConfig {
                rate: 100,
                retry_after_in_seconds: 5,
                errors_file: None,
                allowed_errors: None,
            },
            None,
        );
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let hctx = ctx(&id, &global, &per_request);
        let request = Request::new(Method::GET, "https://graph.example.com/v1/users".parse().unwrap());

        for _ in 0..50 {
            match engine.on_request(&request, &hctx).await.unwrap() {
                RequestOutcome::Respond(resp) => {
                    assert!([429, 500, 502, 503, 504].contains(&resp.status.as_u16()));
                    let body = resp.body.as_ref().and_then(|b| b.as_str()).expect("json body");
                    let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
                    assert!(parsed["error"]["innerError"].is_object(), "default catalog must nest innerError");
                }
                RequestOutcome::Continue => panic!("rate=100 must always fail"),
                RequestOutcome::ContinueWith(_) => panic!("unexpected mutation"),
            }
        }
    }

    #[tokio::test]
    async fn rate_0_never_fails() {
        let engine = RandomErrorEngine::new(
            "random-error",
            RandomErrorConfig {
                rate: 0,
                retry_after_in_seconds: 5,
                errors_file: None,
                allowed_errors: None,
            },
            None,
        );
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let hctx = ctx(&id, &global, &per_request);
        let request = Request::new(Method::GET, "https://graph.example.com/v1/users".parse().unwrap());

        for _ in 0..50 {
            assert!(matches!(engine.on_request(&request, &hctx).await.unwrap(), RequestOutcome::Continue));
        }
    }

    #[tokio::test]
    async fn allowed_errors_restrict_the_catalog() {
        let engine = RandomErrorEngine::new(
            "random-error",
            RandomErrorConfig {
                rate: 100,
                retry_after_in_seconds: 5,
                errors_file: None,
                allowed_errors: Some(vec![429]),
            },
            None,
        );
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let hctx = ctx(&id, &global, &per_request);
        let request = Request::new(Method::GET, "https://graph.example.com/v1/users".parse().unwrap());

        match engine.on_request(&request, &hctx).await.unwrap() {
            RequestOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS),
            _ => panic!("expected a 429"),
        }
    }

    #[tokio::test]
    async fn custom_catalog_overrides_the_default_and_omits_inner_error() {
        use devproxy_config::{ErrorCatalogEntry, ErrorCatalogFile};

        let catalog = ErrorCatalogFile {
            errors: vec![ErrorCatalogEntry { method: "GET".to_string(), statuses: vec![418] }],
        };
        let engine = RandomErrorEngine::new(
            "random-error",
            RandomErrorConfig {
                rate: 100,
                retry_after_in_seconds: 5,
                errors_file: Some("errors.json".to_string()),
                allowed_errors: None,
            },
            Some(catalog),
        );
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let hctx = ctx(&id, &global, &per_request);
        let request = Request::new(Method::GET, "https://api.example.com/x".parse().unwrap());

        match engine.on_request(&request, &hctx).await.unwrap() {
            RequestOutcome::Respond(resp) => {
                assert_eq!(resp.status.as_u16(), 418);
                let body = resp.body.as_ref().and_then(|b| b.as_str()).expect("json body");
                let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
                assert!(parsed["error"]["innerError"].is_null(), "custom catalog must not nest innerError");
            }
            _ => panic!("expected a custom-catalog status"),
        }

        let post = Request::new(Method::POST, "https://api.example.com/x".parse().unwrap());
        assert!(matches!(engine.on_request(&post, &hctx).await.unwrap(), RequestOutcome::Continue));
    }
}
