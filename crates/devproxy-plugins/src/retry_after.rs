//! Retry-after enforcer.
//!
//! Runs ahead of the other mutating plugins (callers are expected to place it
//! first in the dispatcher's plugin list) and short-circuits any request that
//! still falls under a previously-registered throttler.

use std::time::Instant;

use async_trait::async_trait;
use devproxy_core::{Body, HookContext, Plugin, PluginError, Request, RequestOutcome, Response};
use http::StatusCode;

pub struct RetryAfterEnforcer {
    name: String,
}

impl RetryAfterEnforcer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Plugin for RetryAfterEnforcer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, request: &Request, ctx: &HookContext<'_>) -> Result<RequestOutcome, PluginError> {
        let registry = devproxy_core::throttle::registry(ctx.global);
        let now = Instant::now();
        let survivors = registry.sweep(now);

        for throttler in survivors {
            if let Some(decision) = throttler.decide(request, now) {
                if decision.seconds > 0 {
                    let body = serde_json::json!({
                        "error": "Too many requests",
                        "retryAfter": decision.seconds,
                    });
                    let response = Response::new(StatusCode::TOO_MANY_REQUESTS)
                        .with_header(&decision.header_name, decision.seconds.to_string())
                        .with_body(Body::json(&body).map_err(|e| PluginError::msg(e.to_string()))?);
                    return Ok(RequestOutcome::Respond(response));
                }
            }
        }

        Ok(RequestOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_core::{GlobalStore, PerRequestStore, RequestId, ThrottleDecision, Throttler};
    use http::Method;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn an_active_throttler_short_circuits_before_upstream() {
        let enforcer = RetryAfterEnforcer::new("retry-after");
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let ctx = HookContext { request_id: &id, global: &global, per_request: &per_request };

        let registry = devproxy_core::throttle::registry(&global);
        registry.register(Throttler::new(
            "svc",
            Instant::now() + Duration::from_secs(30),
            Arc::new(|_req, _key| {
                Some(ThrottleDecision { seconds: 30, header_name: "Retry-After".to_string() })
            }),
        ));

        let request = Request::new(Method::GET, "https://svc/x".parse().unwrap());
        match enforcer.on_request(&request, &ctx).await.unwrap() {
            RequestOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS),
            _ => panic!("expected the enforcer to short-circuit"),
        }
    }

    #[tokio::test]
    async fn no_throttlers_registered_passes_through() {
        let enforcer = RetryAfterEnforcer::new("retry-after");
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let ctx = HookContext { request_id: &id, global: &global, per_request: &per_request };
        let request = Request::new(Method::GET, "https://svc/x".parse().unwrap());
        assert!(matches!(enforcer.on_request(&request, &ctx).await.unwrap(), RequestOutcome::Continue));
    }
}
