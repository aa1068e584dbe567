//! Container backend subsystem.
//!
//! The backend is a thin driver over a local container runtime. It knows
//! nothing about suites or tests; it only sees primitive container and
//! network resources. All operations are blocking from the caller's point
//! of view, with caller-supplied timeouts on start/stop paths.
//!
//! Re-exports:
//! - [`ContainerBackend`]: the driver trait.
//! - [`DockerBackend`]: production driver over the `docker` CLI.
//! - [`MockBackend`]: in-memory driver with fault injection for tests.

pub mod backend_trait;
pub mod docker;
pub mod mock;
pub mod types;

pub use backend_trait::ContainerBackend;
pub use docker::DockerBackend;
pub use mock::MockBackend;
pub use types::{ContainerOptions, ExecResult, LogStream, StartedContainer, INSTANCE_LABEL};
