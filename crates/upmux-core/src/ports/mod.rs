//! Port definitions (trait abstractions) for external systems.
//!
//! Ports define the interfaces the control plane expects from
//! infrastructure. They use only domain types.
//!
//! # Design Rules
//!
//! - No process, container or HTTP client types in any signature
//! - Storage ports are keyed by server name
//! - Transport variants are selected once per actor through the factory

pub mod config_source;
pub mod event_emitter;
pub mod sandbox;
pub mod token_store;
pub mod transport;

pub use config_source::ConfigSource;
pub use event_emitter::{EventEmitter, NoopEmitter};
pub use sandbox::Sandbox;
pub use token_store::TokenStore;
pub use transport::{Session, Transport, TransportFactory};
