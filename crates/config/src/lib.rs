//! Configuration loading for the roost server.
//!
//! Config comes from `roost.{toml,yaml,yml,json}` (project-local or the
//! path in `ROOST_CONFIG`), with `${ENV_VAR}` placeholders expanded inside
//! the raw file and `ROOST_*` environment overrides applied last.

pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config},
    schema::{
        BridgeConfig, BusConfig, CleanupConfig, RateLimitConfig, RoostConfig, ServerConfig,
        SessionConfig,
    },
};
