//! Latency injector. Sleeps a uniform `[min_ms, max_ms)` delay before
//! letting the request continue.

use async_trait::async_trait;
use devproxy_config::LatencyConfig;
use devproxy_core::{HookContext, Plugin, PluginError, Request, RequestOutcome};
use rand::Rng;
use std::time::Duration;

pub struct LatencyInjector {
    name: String,
    min_ms: u64,
    max_ms: u64,
}

impl LatencyInjector {
    pub fn new(name: impl Into<String>, config: LatencyConfig) -> Self {
        Self {
            name: name.into(),
            min_ms: config.min_ms,
            max_ms: config.max_ms.max(config.min_ms + 1),
        }
    }
}

#[async_trait]
impl Plugin for LatencyInjector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, _request: &Request, _ctx: &HookContext<'_>) -> Result<RequestOutcome, PluginError> {
        let delay_ms = rand::rng().random_range(self.min_ms..self.max_ms);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(RequestOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_core::{GlobalStore, PerRequestStore, RequestId};
    use http::Method;
    use std::time::Instant;

    #[tokio::test]
    async fn sleeps_within_the_configured_window() {
        let injector = LatencyInjector::new("latency", LatencyConfig { min_ms: 20, max_ms: 40 });
        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let ctx = HookContext { request_id: &id, global: &global, per_request: &per_request };
        let request = Request::new(Method::GET, "https://api.example.com/x".parse().unwrap());

        let start = Instant::now();
        let outcome = injector.on_request(&request, &ctx).await.unwrap();
        let elapsed = start.elapsed();

        assert!(matches!(outcome, RequestOutcome::Continue));
        assert!(elapsed >= Duration::from_millis(20));
    }
}
