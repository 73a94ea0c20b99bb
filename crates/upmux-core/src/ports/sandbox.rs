//! Sandbox isolation port.
//!
//! Containers are discoverable by label alone, so a cleanup sweep works even
//! when the actor that created a container is stuck.

use async_trait::async_trait;

use crate::domain::{
    ContainerState, DockerIsolationDefaults, LabelSelector, ManagedContainer, ServerConfig,
};
use crate::error::ResourceError;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Identifier of this process's sandbox instance (the instance label value).
    fn instance_id(&self) -> &str;

    /// Whether the sandbox runtime is usable on this host.
    async fn is_available(&self) -> bool;

    /// Prepare a labeled container for `server`.
    ///
    /// The returned [`ManagedContainer::launch`] is what the transport runs in
    /// place of the server's own command.
    async fn create_labeled(
        &self,
        server: &ServerConfig,
        defaults: &DockerIsolationDefaults,
    ) -> Result<ManagedContainer, ResourceError>;

    async fn inspect(&self, container: &ManagedContainer) -> Result<ContainerState, ResourceError>;

    /// Gracefully stop one container, escalating to a kill.
    async fn stop(&self, container: &ManagedContainer) -> Result<(), ResourceError>;

    /// Ids of containers matching the selector.
    async fn list_by_label(&self, selector: &LabelSelector) -> Result<Vec<String>, ResourceError>;

    /// Force-stop every container matching the selector; returns stopped ids.
    async fn stop_by_label(&self, selector: &LabelSelector) -> Result<Vec<String>, ResourceError>;
}
