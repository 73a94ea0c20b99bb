//! Domain types for upstream configuration and runtime status.
//!
//! These types are pure data. They carry no I/O and are shared by every
//! crate in the workspace.

mod config;
mod container;
mod snapshot;
mod status;
mod token;

pub use config::{
    DockerIsolationDefaults, IsolationSettings, OAuthSettings, Protocol, ProxyConfig,
    ServerConfig, TransportKind,
};
pub use container::{
    ContainerLabels, ContainerState, LABEL_CREATED_BY, LABEL_INSTANCE, LABEL_MANAGED,
    LABEL_SERVER, LabelSelector, LaunchSpec, ManagedContainer,
};
pub use snapshot::{ConfigSnapshot, UpdateKind};
pub use status::{
    ConnectionState, ConnectionStatus, MAX_ERROR_LEN, OAuthState, OAuthStatus, ServerStatus,
    ToolInfo, truncate_error,
};
pub use token::OAuthToken;
