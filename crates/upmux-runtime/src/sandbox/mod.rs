//! Sandbox implementations.

mod docker;
mod instance;

pub use docker::{DockerSandbox, STOP_GRACE_SECS, sanitize_name};
pub use instance::{instance_file, load_or_create_instance_id};
