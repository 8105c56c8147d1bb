//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → keepalive section swapped into the policy store
//!     → running engines see it on their next tick
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only the keepalive policy is hot-reloadable; upstreams need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, KeepaliveSection, ObservabilityConfig, ProxyConfig, ReconnectConfig, UpstreamConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::{PolicyReloader, Reload, ReloadError};
