//! The container backend trait.
//!
//! Drivers implement primitive image, container and network operations.
//! Concurrency is managed by the caller; a driver only has to be safe to
//! share between tasks.

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;

use crate::backend::types::{ContainerOptions, ExecResult, LogStream, StartedContainer};
use crate::error_handling::types::BackendError;

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Builds an image from a directory containing a build context and
    /// returns its tag. Idempotent on unchanged inputs unless `nocache`.
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        nocache: bool,
    ) -> Result<String, BackendError>;

    /// Reads the version artifact (`/version.txt`) baked into an image.
    /// Returns `None` when the image carries no such file.
    async fn image_version(&self, image: &str) -> Result<Option<String>, BackendError>;

    /// Creates and starts a container. Files and tar archives in `opts`
    /// land in the container filesystem before the entrypoint runs; the
    /// container is attached to the default bridge plus `opts.networks`.
    async fn start_container(
        &self,
        image: &str,
        opts: ContainerOptions,
    ) -> Result<StartedContainer, BackendError>;

    /// Force-kills and removes a container. Succeeds when the container
    /// has already exited or is gone entirely.
    async fn stop_container(&self, id: &str) -> Result<(), BackendError>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, BackendError>;

    /// Address of the container on the named network.
    async fn inspect_ip(&self, id: &str, network: &str) -> Result<IpAddr, BackendError>;

    /// Creates a user-defined network and returns its backend id.
    async fn create_network(&self, name: &str) -> Result<String, BackendError>;

    async fn remove_network(&self, name: &str) -> Result<(), BackendError>;

    async fn connect_container(&self, network: &str, id: &str) -> Result<(), BackendError>;

    async fn disconnect_container(&self, network: &str, id: &str) -> Result<(), BackendError>;

    /// Runs a command inside a running container.
    async fn exec(
        &self,
        id: &str,
        cmd: &str,
        user: &str,
        privileged: bool,
    ) -> Result<ExecResult, BackendError>;

    /// Streams the container's combined output; the stream ends when the
    /// container exits.
    async fn follow_logs(&self, id: &str) -> Result<LogStream, BackendError>;

    /// Host-side address reachable from containers on the named network.
    async fn network_gateway(&self, network: &str) -> Result<IpAddr, BackendError>;

    /// Removes every container and network labelled with `label_key`.
    /// Used at startup to clean up after a crashed previous host.
    async fn sweep(&self, label_key: &str) -> Result<usize, BackendError>;
}
