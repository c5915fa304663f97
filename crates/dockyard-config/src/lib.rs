//! Configuration parsing for dockyard.
//!
//! This crate handles parsing of:
//! - System configuration (dockyard.kdl) with environment overrides
//! - Dotenv-style service environments

pub mod env;
pub mod error;
pub mod system;

pub use env::parse_env;
pub use error::{ConfigError, ConfigResult};
pub use system::{
    BuildsConfig, DatabaseConfig, LogFormat, LoggingConfig, LogsConfig, OrchestratorConfig,
    ServerConfig, SystemConfig, parse_system_config,
};
