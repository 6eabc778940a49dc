//! Interception pipeline primitives: the request/response model, URL
//! matching, shared storage, the plugin contract and its dispatcher.
//!
//! Everything in this crate is transport-agnostic — it knows nothing about
//! CONNECT tunnels or TLS certificates, only about requests, responses, and
//! the plugins that get a say over them. The net layer plugs into this.

pub mod error;
pub mod matcher;
pub mod model;
pub mod plugin;
pub mod storage;
pub mod throttle;

pub use error::{PluginError, ProxyError};
pub use matcher::{wildcard_to_regex, UrlPattern, WatchSet};
pub use model::{Body, Request, RequestId, Response};
pub use plugin::{Dispatcher, HookContext, Plugin, RequestOutcome, RequestPhaseOutcome};
pub use storage::{GlobalStore, PerRequestStore, RequestScope};
pub use throttle::{ThrottleDecision, ThrottleRegistry, Throttler};
