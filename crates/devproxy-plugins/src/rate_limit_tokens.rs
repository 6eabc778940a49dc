//! Token-based (LM) rate-limit engine: a fixed window over prompt and
//! completion token usage, keyed per host like its request-count sibling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use devproxy_config::{RateLimitTokensConfig, ResetFormat, WhenLimitExceeded};
use devproxy_core::{
    Body, HookContext, Plugin, PluginError, Request, RequestOutcome, Response, ThrottleDecision, Throttler,
};
use http::StatusCode;
use parking_lot::Mutex;

use crate::window::Window;

/// The cost of an LM request isn't known until its response carries a usage
/// count, so exhaustion can't be detected by watching `remaining` hit zero —
/// a single large request can land anywhere above zero and still be the last
/// one the window can afford. Instead each window remembers the last
/// observed cost and treats "less remaining than that" as exhausted: a proxy
/// for "the next request is likely to blow the budget too".
#[derive(Clone, Copy, Default)]
struct TokenBudget {
    prompt_remaining: u64,
    completion_remaining: u64,
    last_prompt_cost: u64,
    last_completion_cost: u64,
}

pub struct RateLimitTokens {
    name: String,
    config: RateLimitTokensConfig,
    windows: Mutex<HashMap<String, Arc<Window<TokenBudget>>>>,
}

impl RateLimitTokens {
    pub fn new(name: impl Into<String>, config: RateLimitTokensConfig) -> Self {
        Self {
            name: name.into(),
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn fresh_budget(&self) -> TokenBudget {
        TokenBudget {
            prompt_remaining: self.config.prompt_token_limit,
            completion_remaining: self.config.completion_token_limit,
            last_prompt_cost: 0,
            last_completion_cost: 0,
        }
    }

    fn window_for(&self, host: &str, now: Instant) -> Arc<Window<TokenBudget>> {
        let mut windows = self.windows.lock();
        windows
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(Window::new(
                    std::time::Duration::from_secs(self.config.reset_time_window_seconds),
                    self.fresh_budget(),
                    now,
                ))
            })
            .clone()
    }

    fn reset_value(&self, seconds_left: u64) -> String {
        match self.config.reset_format {
            ResetFormat::SecondsLeft => seconds_left.to_string(),
            ResetFormat::UtcEpochSeconds => {
                let epoch = chrono::Utc::now() + chrono::Duration::seconds(seconds_left as i64);
                epoch.timestamp().to_string()
            }
        }
    }

    fn throttle_response(&self, seconds_left: u64) -> Response {
        let header_name = self.config.header_retry_after.clone().unwrap_or_else(|| "Retry-After".to_string());
        let body = serde_json::json!({
            "error": {
                "code": "insufficient_quota",
                "message": "Token budget exhausted for this window",
            }
        });
        let mut response = Response::new(StatusCode::TOO_MANY_REQUESTS)
            .with_header(&header_name, self.reset_value(seconds_left))
            .with_body(Body::json(&body).unwrap());
        if matches!(self.config.when_limit_exceeded, WhenLimitExceeded::Custom) {
            if let Some(path) = &self.config.custom_response_file {
                if let Ok(text) = std::fs::read_to_string(path) {
                    response = response.with_body(Body::text(text.replace("@dynamic", &seconds_left.to_string())));
                }
            }
        }
        response
    }

    fn is_language_model_request(body: Option<&str>) -> bool {
        let Some(body) = body else { return false };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
            return false;
        };
        value.get("prompt").is_some() || value.get("messages").is_some()
    }
}

#[async_trait]
impl Plugin for RateLimitTokens {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, request: &Request, ctx: &HookContext<'_>) -> Result<RequestOutcome, PluginError> {
        if !Self::is_language_model_request(request.body.as_ref().and_then(|b| b.as_str())) {
            return Ok(RequestOutcome::Continue);
        }

        let host = request.host().unwrap_or_default();
        let now = Instant::now();
        let window = self.window_for(&host, now);

        let (exhausted, reset_time) = window.with_counters(now, || self.fresh_budget(), |b| {
            b.prompt_remaining < b.last_prompt_cost || b.completion_remaining < b.last_completion_cost
        });

        if exhausted {
            let seconds_left = reset_time.saturating_duration_since(now).as_secs();
            let registry = devproxy_core::throttle::registry(ctx.global);
            let throttle_window = window.clone();
            let header_name = self.config.header_retry_after.clone().unwrap_or_else(|| "Retry-After".to_string());
            let throttler_host = host.clone();
            let fresh = self.fresh_budget();
            registry.register(Throttler::new(
                format!("{}::{}", self.name, host),
                reset_time,
                Arc::new(move |req: &Request, _key: &str| {
                    if req.host().unwrap_or_default() != throttler_host {
                        return None;
                    }
                    let now = Instant::now();
                    let (exhausted, reset_time) = throttle_window.with_counters(now, || fresh, |b| {
                        b.prompt_remaining < b.last_prompt_cost || b.completion_remaining < b.last_completion_cost
                    });
                    if exhausted {
                        Some(ThrottleDecision {
                            seconds: reset_time.saturating_duration_since(now).as_secs(),
                            header_name: header_name.clone(),
                        })
                    } else {
                        None
                    }
                }),
            ));
            return Ok(RequestOutcome::Respond(self.throttle_response(seconds_left)));
        }

        Ok(RequestOutcome::Continue)
    }

    async fn on_response(
        &self,
        request: &Request,
        response: &Response,
        _ctx: &HookContext<'_>,
    ) -> Result<Option<Response>, PluginError> {
        let Some(body) = response.body.as_ref().and_then(|b| b.as_str()) else {
            return Ok(None);
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
            return Ok(None);
        };
        let prompt_tokens = value.pointer("/usage/prompt_tokens").and_then(|v| v.as_u64());
        let completion_tokens = value.pointer("/usage/completion_tokens").and_then(|v| v.as_u64());
        let (Some(prompt_tokens), Some(completion_tokens)) = (prompt_tokens, completion_tokens) else {
            return Ok(None);
        };

        let host = request.host().unwrap_or_default();
        let now = Instant::now();
        let window = self.window_for(&host, now);
        window.with_counters(now, || self.fresh_budget(), |b| {
            b.prompt_remaining = b.prompt_remaining.saturating_sub(prompt_tokens);
            b.completion_remaining = b.completion_remaining.saturating_sub(completion_tokens);
            b.last_prompt_cost = prompt_tokens;
            b.last_completion_cost = completion_tokens;
        });

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_core::{GlobalStore, PerRequestStore, RequestId};
    use http::Method;

    fn config() -> RateLimitTokensConfig {
        RateLimitTokensConfig {
            prompt_token_limit: 10,
            completion_token_limit: 10,
            reset_time_window_seconds: 60,
            header_retry_after: None,
            reset_format: ResetFormat::SecondsLeft,
            when_limit_exceeded: WhenLimitExceeded::Throttle,
            custom_response_file: None,
        }
    }

    fn hctx<'a>(id: &'a RequestId, global: &'a GlobalStore, per_request: &'a PerRequestStore) -> HookContext<'a> {
        HookContext { request_id: id, global, per_request }
    }

    #[tokio::test]
    async fn second_request_is_throttled_after_budget_exhausted() {
        let engine = RateLimitTokens::new("token-rate-limiting", config());
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();

        let request = Request {
            method: Method::POST,
            uri: "https://llm.example.com/chat".parse().unwrap(),
            headers: http::HeaderMap::new(),
            body: Some(Body::text(r#"{"prompt":"hi"}"#)),
        };
        let upstream_response = Response::new(StatusCode::OK)
            .with_body(Body::text(r#"{"usage":{"prompt_tokens":9,"completion_tokens":9}}"#));

        let id = RequestId::new();
        let ctx = hctx(&id, &global, &per_request);
        assert!(matches!(engine.on_request(&request, &ctx).await.unwrap(), RequestOutcome::Continue));
        engine.on_response(&request, &upstream_response, &ctx).await.unwrap();

        let id2 = RequestId::new();
        let ctx2 = hctx(&id2, &global, &per_request);
        match engine.on_request(&request, &ctx2).await.unwrap() {
            RequestOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS),
            _ => panic!("expected the second request to be throttled"),
        }
    }

    #[tokio::test]
    async fn non_lm_requests_pass_through() {
        let engine = RateLimitTokens::new("token-rate-limiting", config());
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let ctx = hctx(&id, &global, &per_request);
        let request = Request::new(Method::GET, "https://svc/health".parse().unwrap());
        assert!(matches!(engine.on_request(&request, &ctx).await.unwrap(), RequestOutcome::Continue));
    }
}
