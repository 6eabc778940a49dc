//! The error taxonomy a single intercepted request can fail with.
//!
//! Each variant corresponds to a row of the error-handling design: a cause, the
//! disposition the pipeline takes in response, and what ends up in the logs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration is invalid: {0}")]
    ConfigInvalid(String),

    #[error("plugin `{plugin}` failed handling request {request_id}: {source}")]
    PluginFailure {
        plugin: String,
        request_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("upstream connection failed: {0}")]
    UpstreamUnreachable(#[source] anyhow::Error),

    #[error("throttled: retry after {retry_after_seconds}s")]
    ThrottleExceeded {
        retry_after_seconds: u64,
        header_name: String,
    },

    #[error("mock response file not found: {0}")]
    MockFileMissing(String),

    #[error("failed to mint a TLS certificate for {0}")]
    CertificateMintFailure(String),

    #[error("invalid url-to-watch pattern `{0}`")]
    InvalidWatchPattern(String, #[source] regex::Error),
}

/// Wraps whatever a plugin hook failed with; never aborts the request it was
/// raised from, only the hook invocation that raised it.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct PluginError(#[from] pub anyhow::Error);

impl PluginError {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(anyhow::anyhow!(msg.into()))
    }
}
