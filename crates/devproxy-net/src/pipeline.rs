//! The per-request interception sequence and the process-wide inactivity
//! timer that bounds how long the proxy stays up with nothing happening.

use std::sync::Arc;
use std::time::{Duration, Instant};

use devproxy_core::{
    Dispatcher, GlobalStore, HookContext, PerRequestStore, Request, RequestId, RequestPhaseOutcome,
    Response, WatchSet,
};
use http::StatusCode;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::forward::Forwarder;

/// Runs watched requests through the plugin dispatcher and forwards
/// everything else untouched. One instance is shared across every accepted
/// connection.
pub struct Pipeline {
    dispatcher: Dispatcher,
    watch: WatchSet,
    global: Arc<GlobalStore>,
    per_request: Arc<PerRequestStore>,
    forwarder: Forwarder,
    watchdog: Arc<Watchdog>,
}

impl Pipeline {
    pub fn new(
        dispatcher: Dispatcher,
        watch: WatchSet,
        global: Arc<GlobalStore>,
        per_request: Arc<PerRequestStore>,
        forwarder: Forwarder,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        Self {
            dispatcher,
            watch,
            global,
            per_request,
            forwarder,
            watchdog,
        }
    }

    /// Used by the CONNECT handler to decide whether a tunnel needs MITM-ing
    /// at all, before any TLS handshake has happened.
    pub fn is_host_watched(&self, host: &str) -> bool {
        self.watch.is_host_watched(host)
    }

    pub async fn process(&self, request: Request) -> Response {
        self.watchdog.reset();
        let scope = self.per_request.acquire(RequestId::new());
        let ctx = HookContext {
            request_id: scope.id(),
            global: &self.global,
            per_request: scope.store(),
        };

        if !self.watch.is_url_watched(&request.url()) {
            return self.upstream(&request).await;
        }

        let snapshot = request.clone();
        let (forwarded_request, response) = match self.dispatcher.dispatch_request(request, &ctx).await {
            RequestPhaseOutcome::NotWatched(req) => {
                let resp = self.upstream(&req).await;
                (req, resp)
            }
            RequestPhaseOutcome::Forward(req) => {
                let resp = self.upstream(&req).await;
                (req, resp)
            }
            RequestPhaseOutcome::ShortCircuit(resp) => (snapshot, resp),
        };

        self.dispatcher.dispatch_response(&forwarded_request, response, &ctx).await
    }

    async fn upstream(&self, request: &Request) -> Response {
        match self.forwarder.send(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, url = %request.url(), "upstream request failed");
                Response::new(StatusCode::BAD_GATEWAY).with_body(devproxy_core::Body::text(e.to_string()))
            }
        }
    }
}

/// Tracks how long it has been since the last intercepted request and cancels
/// `token` once that idle stretch exceeds `idle_timeout`. In-flight work drains
/// for `drain_grace` afterwards before the caller tears the listener down.
pub struct Watchdog {
    last_seen: Mutex<Instant>,
    idle_timeout: Duration,
    drain_grace: Duration,
    token: CancellationToken,
}

impl Watchdog {
    pub fn new(idle_timeout: Duration, drain_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            last_seen: Mutex::new(Instant::now()),
            idle_timeout,
            drain_grace,
            token: CancellationToken::new(),
        })
    }

    pub fn reset(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Polls the idle duration once a second and cancels `token` the first
    /// time it crosses `idle_timeout`. Returns once the grace period after
    /// cancellation has elapsed, so the caller knows it's safe to stop.
    pub async fn run(self: Arc<Self>) {
        let poll = Duration::from_secs(1);
        loop {
            tokio::time::sleep(poll).await;
            let idle = self.last_seen.lock().elapsed();
            if idle >= self.idle_timeout {
                tracing::info!(idle_seconds = idle.as_secs(), "no requests intercepted; shutting down");
                self.token.cancel();
                tokio::time::sleep(self.drain_grace).await;
                return;
            }
        }
    }
}
