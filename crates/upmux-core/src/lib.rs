//! Core domain types, ports and services for the upmux control plane.
//!
//! This crate has no knowledge of processes, containers or HTTP clients.
//! Adapters live in `upmux-mcp` (transports) and `upmux-runtime`
//! (supervisor, actors, OAuth, sandbox).
#![deny(unused_crate_dependencies)]

pub mod backoff;
pub mod domain;
pub mod error;
pub mod events;
pub mod paths;
pub mod ports;
pub mod services;

pub use backoff::{BackoffPolicy, MAX_BACKOFF_EXPONENT};
pub use domain::{
    ConfigSnapshot, ConnectionState, ConnectionStatus, ContainerLabels, ContainerState,
    DockerIsolationDefaults, IsolationSettings, LabelSelector, LaunchSpec, ManagedContainer,
    OAuthSettings, OAuthState, OAuthStatus, OAuthToken, Protocol, ProxyConfig, ServerConfig,
    ServerStatus, ToolInfo, TransportKind, UpdateKind, truncate_error,
};
pub use error::{
    AuthError, AuthErrorClass, ConfigError, ResourceError, TokenStoreError, TransportError,
};
pub use events::{ReconcileCounts, UpstreamEvent};
pub use ports::{
    ConfigSource, EventEmitter, NoopEmitter, Sandbox, Session, TokenStore, Transport,
    TransportFactory,
};
pub use services::ConfigService;
