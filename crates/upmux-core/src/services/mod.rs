//! Core services.
//!
//! Services here orchestrate domain logic and own no I/O beyond the config
//! file they are pointed at.

mod config_service;

pub use config_service::ConfigService;
