//! Config-file and mock-file schema, loading and validation.

pub mod loader;
pub mod schema;

pub use loader::{is_present_and_nonempty, load_config, load_error_catalog_file, load_mock_file};
pub use schema::{
    Config, ErrorCatalogEntry, ErrorCatalogFile, LatencyConfig, MockEntry, MockFile, MockPluginConfig,
    MockRequestMatcher, MockResponseSpec, PluginEntry, RandomErrorConfig, RateLimitConfig, RateLimitTokensConfig,
    ResetFormat, WhenLimitExceeded,
};
