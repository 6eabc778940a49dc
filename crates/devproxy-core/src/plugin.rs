//! The plugin contract and the dispatcher that drives it across both
//! interception phases.
//!
//! Each plugin is a trait object with four hooks, all optional by virtue of a
//! no-op default: `on_request_log` and `on_response_log` are observers that
//! run concurrently and cannot affect the outcome; `on_request` and
//! `on_response` are mutators that run in registration order and stop at the
//! first one that produces an outcome.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::error::PluginError;
use crate::model::{Request, RequestId, Response};
use crate::storage::{GlobalStore, PerRequestStore};

/// Borrowed state a hook needs to read or mutate shared storage.
pub struct HookContext<'a> {
    pub request_id: &'a RequestId,
    pub global: &'a GlobalStore,
    pub per_request: &'a PerRequestStore,
}

/// What a request-phase mutator decided.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// Forward the request unchanged.
    Continue,
    /// Forward a modified request in its place.
    ContinueWith(Request),
    /// Skip the upstream call entirely and answer with this response.
    Respond(Response),
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Plugins that are present in the pipeline but currently switched off
    /// (e.g. the recording controller outside of a recording session) return
    /// `false` here; the dispatcher skips all four hooks for them.
    fn enabled(&self) -> bool {
        true
    }

    async fn on_request_log(&self, _request: &Request, _ctx: &HookContext<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_request(
        &self,
        _request: &Request,
        _ctx: &HookContext<'_>,
    ) -> Result<RequestOutcome, PluginError> {
        Ok(RequestOutcome::Continue)
    }

    async fn on_response_log(
        &self,
        _request: &Request,
        _response: &Response,
        _ctx: &HookContext<'_>,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_response(
        &self,
        _request: &Request,
        _response: &Response,
        _ctx: &HookContext<'_>,
    ) -> Result<Option<Response>, PluginError> {
        Ok(None)
    }
}

/// Result of running the request phase.
pub enum RequestPhaseOutcome {
    /// The URL wasn't in the watch set; no hook ran at all.
    NotWatched(Request),
    /// Hooks ran and none of them short-circuited; forward this request.
    Forward(Request),
    /// A plugin answered directly; the upstream is never called.
    ShortCircuit(Response),
}

/// Runs the registered plugins, in order, against both interception phases.
pub struct Dispatcher {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Dispatcher {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    fn enabled_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.iter().filter(|p| p.enabled()).cloned().collect()
    }

    pub async fn dispatch_request(&self, mut request: Request, ctx: &HookContext<'_>) -> RequestPhaseOutcome {
        let plugins = self.enabled_plugins();

        let log_futs = plugins.iter().map(|p| {
            let p = p.clone();
            let request = &request;
            async move { (p.name().to_string(), p.on_request_log(request, ctx).await) }
        });
        for (name, result) in join_all(log_futs).await {
            if let Err(e) = result {
                tracing::warn!(plugin = %name, request_id = %ctx.request_id, error = %e.0, "on_request_log failed; continuing");
            }
        }

        for p in &plugins {
            match p.on_request(&request, ctx).await {
                Ok(RequestOutcome::Continue) => {}
                Ok(RequestOutcome::ContinueWith(replacement)) => request = replacement,
                Ok(RequestOutcome::Respond(response)) => return RequestPhaseOutcome::ShortCircuit(response),
                Err(e) => {
                    tracing::warn!(plugin = %p.name(), request_id = %ctx.request_id, error = %e.0, "on_request failed; continuing");
                }
            }
        }

        RequestPhaseOutcome::Forward(request)
    }

    pub async fn dispatch_response(
        &self,
        request: &Request,
        response: Response,
        ctx: &HookContext<'_>,
    ) -> Response {
        let plugins = self.enabled_plugins();

        let log_futs = plugins.iter().map(|p| {
            let p = p.clone();
            let response = &response;
            async move { (p.name().to_string(), p.on_response_log(request, response, ctx).await) }
        });
        for (name, result) in join_all(log_futs).await {
            if let Err(e) = result {
                tracing::warn!(plugin = %name, request_id = %ctx.request_id, error = %e.0, "on_response_log failed; continuing");
            }
        }

        let mut current = response;
        for p in &plugins {
            match p.on_response(request, &current, ctx).await {
                Ok(Some(replacement)) => {
                    current = replacement;
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(plugin = %p.name(), request_id = %ctx.request_id, error = %e.0, "on_response failed; continuing");
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode, Uri};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_request(
            &self,
            _request: &Request,
            _ctx: &HookContext<'_>,
        ) -> Result<RequestOutcome, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RequestOutcome::Continue)
        }
    }

    struct RespondingPlugin;

    #[async_trait]
    impl Plugin for RespondingPlugin {
        fn name(&self) -> &str {
            "responder"
        }

        async fn on_request(
            &self,
            _request: &Request,
            _ctx: &HookContext<'_>,
        ) -> Result<RequestOutcome, PluginError> {
            Ok(RequestOutcome::Respond(Response::new(StatusCode::IM_A_TEAPOT)))
        }
    }

    struct FailingPlugin;

    #[async_trait]
    impl Plugin for FailingPlugin {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_request(
            &self,
            _request: &Request,
            _ctx: &HookContext<'_>,
        ) -> Result<RequestOutcome, PluginError> {
            Err(PluginError::msg("boom"))
        }
    }

    fn dummy_request() -> Request {
        Request::new(Method::GET, Uri::from_static("https://example.com/"))
    }

    #[tokio::test]
    async fn short_circuit_stops_later_plugins() {
        let first = Arc::new(CountingPlugin {
            name: "first",
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(vec![Arc::new(RespondingPlugin), first.clone()]);

        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let ctx = HookContext {
            request_id: &id,
            global: &global,
            per_request: &per_request,
        };

        match dispatcher.dispatch_request(dummy_request(), &ctx).await {
            RequestPhaseOutcome::ShortCircuit(resp) => assert_eq!(resp.status, StatusCode::IM_A_TEAPOT),
            _ => panic!("expected short circuit"),
        }
        assert_eq!(first.calls.load(Ordering::SeqCst), 0, "plugin after a responder must not run");
    }

    #[tokio::test]
    async fn failing_plugin_does_not_abort_the_request() {
        let after = Arc::new(CountingPlugin {
            name: "after",
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(vec![Arc::new(FailingPlugin), after.clone()]);

        let global = GlobalStore::new();
        let per_request = PerRequestStore::new();
        let id = RequestId::new();
        let ctx = HookContext {
            request_id: &id,
            global: &global,
            per_request: &per_request,
        };

        match dispatcher.dispatch_request(dummy_request(), &ctx).await {
            RequestPhaseOutcome::Forward(_) => {}
            _ => panic!("expected forward"),
        }
        assert_eq!(after.calls.load(Ordering::SeqCst), 1, "plugin after a failure must still run");
    }
}
