//! Request-count rate-limit engine: a fixed window per host, decremented
//! by a configurable cost per matching request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use devproxy_config::{RateLimitConfig, ResetFormat, WhenLimitExceeded};
use devproxy_core::{
    Body, HookContext, Plugin, PluginError, Request, RequestOutcome, Response, ThrottleDecision, Throttler,
};
use http::StatusCode;
use parking_lot::Mutex;

use crate::window::Window;

const HEADERS_SLOT_SUFFIX: &str = "::rate_limit_headers";

pub struct RateLimitCount {
    name: String,
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Arc<Window<u32>>>>,
}

impl RateLimitCount {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window_for(&self, host: &str, now: Instant) -> Arc<Window<u32>> {
        let mut windows = self.windows.lock();
        windows
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Window::new(window_duration(&self.config), self.config.rate_limit, now)))
            .clone()
    }

    fn headers_slot(&self) -> String {
        format!("{}{}", self.name, HEADERS_SLOT_SUFFIX)
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
        match self.config.when_limit_exceeded {
            WhenLimitExceeded::Throttle => {
                let body = serde_json::json!({
                    "error": "Rate limit exceeded",
                    "retryAfter": seconds_left,
                });
                Response::new(StatusCode::TOO_MANY_REQUESTS)
                    .with_header(&header_name, seconds_left.to_string())
                    .with_body(Body::json(&body).unwrap())
            }
            WhenLimitExceeded::Custom => {
                let body = self
                    .config
                    .custom_response_file
                    .as_ref()
                    .and_then(|path| std::fs::read_to_string(path).ok())
                    .map(|s| s.replace("@dynamic", &seconds_left.to_string()))
                    .unwrap_or_else(|| format!("{{\"retryAfter\":{seconds_left}}}"));
                Response::new(StatusCode::TOO_MANY_REQUESTS)
                    .with_header(&header_name, seconds_left.to_string())
                    .with_body(Body::text(body))
            }
        }
    }
}

fn window_duration(config: &RateLimitConfig) -> std::time::Duration {
    std::time::Duration::from_secs(config.reset_time_window_seconds)
}

#[async_trait]
impl Plugin for RateLimitCount {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, request: &Request, ctx: &HookContext<'_>) -> Result<RequestOutcome, PluginError> {
        let host = request.host().unwrap_or_default();
        let now = Instant::now();
        let window = self.window_for(&host, now);
        let cost = self.config.cost_per_request;

        let (outcome, reset_time) = window.with_counters(
            now,
            || self.config.rate_limit,
            |r| {
                if *r == 0 {
                    None
                } else {
                    *r = r.saturating_sub(cost);
                    Some(*r)
                }
            },
        );

        let Some(remaining) = outcome else {
            let seconds_left = reset_time.saturating_duration_since(now).as_secs();

            let registry = devproxy_core::throttle::registry(ctx.global);
            let throttle_window = window.clone();
            let header_name = self.config.header_retry_after.clone().unwrap_or_else(|| "Retry-After".to_string());
            let throttler_host = host.clone();
            let limit = self.config.rate_limit;
            registry.register(Throttler::new(
                format!("{}::{}", self.name, host),
                reset_time,
                Arc::new(move |req: &Request, _key: &str| {
                    if req.host().unwrap_or_default() != throttler_host {
                        return None;
                    }
                    let now = Instant::now();
                    let (remaining, reset_time) = throttle_window.with_counters(now, || limit, |r| *r);
                    if remaining == 0 {
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

        let limit = self.config.rate_limit;
        let warning_floor = (limit as u64 * self.config.warning_threshold_percent as u64 / 100) as u32;
        if remaining < warning_floor {
            let seconds_left = reset_time.saturating_duration_since(now).as_secs();
            let headers = vec![
                (self.config.header_limit.clone().unwrap_or_else(|| "RateLimit-Limit".to_string()), limit.to_string()),
                (
                    self.config.header_remaining.clone().unwrap_or_else(|| "RateLimit-Remaining".to_string()),
                    remaining.to_string(),
                ),
                (
                    self.config.header_reset.clone().unwrap_or_else(|| "RateLimit-Reset".to_string()),
                    self.reset_value(seconds_left),
                ),
            ];
            ctx.per_request.set(ctx.request_id, self.headers_slot(), headers);
        }

        Ok(RequestOutcome::Continue)
    }

    async fn on_response(
        &self,
        request: &Request,
        response: &Response,
        ctx: &HookContext<'_>,
    ) -> Result<Option<Response>, PluginError> {
        let headers = ctx.per_request.get::<Vec<(String, String)>>(ctx.request_id, &self.headers_slot());
        let has_origin = request.header("origin").is_some();
        if headers.is_none() && !has_origin {
            return Ok(None);
        }

        let mut out = response.clone();
        let mut exposed = Vec::new();
        if let Some(headers) = headers {
            for (k, v) in &headers {
                out = out.with_header(k, v);
                exposed.push(k.clone());
            }
        }
        if has_origin {
            out = out.with_header("Access-Control-Allow-Origin", "*");
            if !exposed.is_empty() {
                out = out.with_header("Access-Control-Expose-Headers", exposed.join(", "));
            }
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_core::{GlobalStore, PerRequestStore, RequestId};
    use http::Method;

    fn default_config(limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            rate_limit: limit,
            cost_per_request: 1,
            reset_time_window_seconds: 60,
            warning_threshold_percent: 80,
            header_limit: None,
            header_remaining: None,
            header_reset: None,
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
    async fn third_request_over_limit_two_is_throttled() {
        let engine = RateLimitCount::new("rate-limiting", default_config(2));
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let request = Request::new(Method::GET, "https://svc/x".parse().unwrap());

        for _ in 0..2 {
            let id = RequestId::new();
            let ctx = hctx(&id, &global, &per_request);
            assert!(matches!(engine.on_request(&request, &ctx).await.unwrap(), RequestOutcome::Continue));
        }

        let id = RequestId::new();
        let ctx = hctx(&id, &global, &per_request);
        match engine.on_request(&request, &ctx).await.unwrap() {
            RequestOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS),
            _ => panic!("expected throttling on the third request"),
        }
    }

    #[tokio::test]
    async fn remaining_never_goes_negative() {
        let engine = RateLimitCount::new("rate-limiting", default_config(1));
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let request = Request::new(Method::GET, "https://svc/y".parse().unwrap());

        for _ in 0..5 {
            let id = RequestId::new();
            let ctx = hctx(&id, &global, &per_request);
            let _ = engine.on_request(&request, &ctx).await.unwrap();
        }
        let windows = engine.windows.lock();
        let window = windows.get("svc").unwrap();
        let (remaining, _) = window.with_counters(Instant::now(), || 1, |r| *r);
        assert!(remaining == 0 || remaining == 1);
    }
}
