//! JSON shapes for the config file and the mock file. Defaults are attached
//! with `#[serde(default = "...")]` so a config that omits a field gets the
//! documented default rather than a parse error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_cost_per_request() -> u32 {
    2
}
fn default_reset_window_seconds() -> u64 {
    60
}
fn default_warning_threshold_percent() -> u8 {
    80
}
fn default_random_error_rate() -> u8 {
    50
}
fn default_retry_after_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResetFormat {
    SecondsLeft,
    UtcEpochSeconds,
}

impl Default for ResetFormat {
    fn default() -> Self {
        ResetFormat::SecondsLeft
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WhenLimitExceeded {
    Throttle,
    Custom,
}

impl Default for WhenLimitExceeded {
    fn default() -> Self {
        WhenLimitExceeded::Throttle
    }
}

/// Recognized fields for a request-count rate-limit plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub rate_limit: u32,
    #[serde(default = "default_cost_per_request")]
    pub cost_per_request: u32,
    #[serde(default = "default_reset_window_seconds")]
    pub reset_time_window_seconds: u64,
    #[serde(default = "default_warning_threshold_percent")]
    pub warning_threshold_percent: u8,
    #[serde(default)]
    pub header_limit: Option<String>,
    #[serde(default)]
    pub header_remaining: Option<String>,
    #[serde(default)]
    pub header_reset: Option<String>,
    #[serde(default)]
    pub header_retry_after: Option<String>,
    #[serde(default)]
    pub reset_format: ResetFormat,
    #[serde(default)]
    pub when_limit_exceeded: WhenLimitExceeded,
    #[serde(default)]
    pub custom_response_file: Option<String>,
}

/// Recognized fields for a token-based (LM) rate-limit plugin instance,
/// reusing `RateLimitConfig`'s shared fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitTokensConfig {
    pub prompt_token_limit: u64,
    pub completion_token_limit: u64,
    #[serde(default = "default_reset_window_seconds")]
    pub reset_time_window_seconds: u64,
    #[serde(default)]
    pub header_retry_after: Option<String>,
    #[serde(default)]
    pub reset_format: ResetFormat,
    #[serde(default)]
    pub when_limit_exceeded: WhenLimitExceeded,
    #[serde(default)]
    pub custom_response_file: Option<String>,
}

/// Recognized fields for the random-error plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomErrorConfig {
    #[serde(default = "default_random_error_rate")]
    pub rate: u8,
    #[serde(default = "default_retry_after_seconds")]
    pub retry_after_in_seconds: u64,
    #[serde(default)]
    pub errors_file: Option<String>,
    #[serde(default)]
    pub allowed_errors: Option<Vec<u16>>,
}

fn default_any_method() -> String {
    "*".to_string()
}

/// One entry of a custom error catalog file: the statuses available for
/// `method`, or for every method when `method` is `"*"`. A custom catalog
/// replaces the engine's built-in default entirely — a method not named
/// here (and not covered by a `"*"` entry) simply has no candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCatalogEntry {
    #[serde(default = "default_any_method")]
    pub method: String,
    pub statuses: Vec<u16>,
}

/// `{"errors": [...]}` — a custom catalog for the random-error plugin's
/// `errorsFile` field. Unlike the engine's built-in default, a custom
/// catalog isn't assumed to be shaped like any particular provider's error
/// schema, so its bodies carry only `{code, message}`, no `innerError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCatalogFile {
    pub errors: Vec<ErrorCatalogEntry>,
}

/// `{min_ms, max_ms}` for the latency-injection plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Plugin-instance config for the mock-response engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockPluginConfig {
    pub mocks_file: String,
    #[serde(default)]
    pub block_unmocked_requests: bool,
    /// `*`-glob matched against the request URL to recognize a provider batch
    /// endpoint (e.g. Microsoft Graph's `/v1.0/$batch`) worth fanning out.
    #[serde(default)]
    pub batch_endpoint: Option<String>,
}

/// One entry of `plugins[]` in the config file: `{name, enabled, config}`.
/// `config` is whatever shape `name` expects; deserialized on demand by the
/// wiring code that knows which plugin `name` names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// The top-level config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ip_address")]
    pub ip_address: String,
    #[serde(default)]
    pub urls_to_watch: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub new_version_notification: Option<String>,
}

fn default_port() -> u16 {
    8000
}
fn default_ip_address() -> String {
    "127.0.0.1".to_string()
}

/// `{method, url, bodyFragment?, nth?}` — the request side of a mock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRequestMatcher {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub body_fragment: Option<String>,
    #[serde(default)]
    pub nth: Option<u32>,
}

/// `{statusCode?, headers?, body?}` — the canned response side of a mock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponseSpec {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockEntry {
    pub request: MockRequestMatcher,
    pub response: MockResponseSpec,
}

/// `{"$schema", "mocks": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockFile {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub mocks: Vec<MockEntry>,
}
