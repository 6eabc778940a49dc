//! Throttling registry: an append-only list of per-plugin throttling decisions,
//! swept for expired entries every time it is read rather than on a timer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::model::Request;
use crate::storage::GlobalStore;

/// The key under which the registry lives in [`crate::storage::GlobalStore`].
pub const GLOBAL_KEY: &str = "throttled_requests";

/// What a throttler decided for one request: how long the caller must wait,
/// and which header should carry that value back to the client.
#[derive(Debug, Clone)]
pub struct ThrottleDecision {
    pub seconds: u64,
    pub header_name: String,
}

/// A plugin's own predicate for whether a given request should still be
/// throttled under this key. Takes the request and the throttling key it was
/// registered under, so one function can serve several keys.
pub type DecideFn = Arc<dyn Fn(&Request, &str) -> Option<ThrottleDecision> + Send + Sync>;

/// One registered throttling rule. `reset_time` is refreshed every time
/// `decide` produces a fresh decision, so a client that keeps tripping the
/// same limiter keeps seeing it extended rather than it lapsing underneath it.
pub struct Throttler {
    pub throttling_key: String,
    decide: DecideFn,
    reset_time: RwLock<Instant>,
}

impl Throttler {
    pub fn new(throttling_key: impl Into<String>, reset_time: Instant, decide: DecideFn) -> Arc<Self> {
        Arc::new(Self {
            throttling_key: throttling_key.into(),
            decide,
            reset_time: RwLock::new(reset_time),
        })
    }

    pub fn reset_time(&self) -> Instant {
        *self.reset_time.read()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.reset_time() <= now
    }

    /// Consults the underlying predicate and, if it still applies, pushes
    /// `reset_time` out by the decision's window.
    pub fn decide(&self, request: &Request, now: Instant) -> Option<ThrottleDecision> {
        let decision = (self.decide)(request, &self.throttling_key);
        if let Some(d) = &decision {
            *self.reset_time.write() = now + Duration::from_secs(d.seconds);
        }
        decision
    }
}

/// Holds every throttler currently registered. Sweeping happens lazily: each
/// read drops entries whose `reset_time` has already passed before handing
/// back the survivors, so no background task is needed to keep it tidy.
#[derive(Default)]
pub struct ThrottleRegistry {
    entries: RwLock<Vec<Arc<Throttler>>>,
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, throttler: Arc<Throttler>) {
        self.entries.write().push(throttler);
    }

    /// Drops expired entries and returns the ones still live, in registration order.
    pub fn sweep(&self, now: Instant) -> Vec<Arc<Throttler>> {
        let mut entries = self.entries.write();
        entries.retain(|t| !t.is_expired(now));
        entries.clone()
    }

    pub fn len_unswept(&self) -> usize {
        self.entries.read().len()
    }
}

/// Fetches the process-wide registry, creating it empty on first use.
pub fn registry(global: &GlobalStore) -> Arc<ThrottleRegistry> {
    global.with_mut::<Arc<ThrottleRegistry>, _>(GLOBAL_KEY, |r| r.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    fn dummy_request() -> Request {
        Request::new(Method::GET, Uri::from_static("https://example.com/"))
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let registry = ThrottleRegistry::new();
        let now = Instant::now();
        registry.register(Throttler::new(
            "k1",
            now - Duration::from_secs(1),
            Arc::new(|_, _| None),
        ));
        registry.register(Throttler::new("k2", now + Duration::from_secs(60), Arc::new(|_, _| None)));

        let live = registry.sweep(now);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].throttling_key, "k2");
    }

    #[test]
    fn decide_extends_reset_time_on_match() {
        let now = Instant::now();
        let throttler = Throttler::new(
            "lm-tokens",
            now + Duration::from_secs(1),
            Arc::new(|_, _| {
                Some(ThrottleDecision {
                    seconds: 30,
                    header_name: "Retry-After".to_string(),
                })
            }),
        );
        let decision = throttler.decide(&dummy_request(), now).unwrap();
        assert_eq!(decision.seconds, 30);
        assert!(throttler.reset_time() >= now + Duration::from_secs(30));
    }
}
