//! Error types shared across the host.
//!
//! The control plane maps [`LifecycleError`] onto HTTP statuses: input
//! problems from simulators become 4xx, backend trouble becomes 5xx.

use std::path::PathBuf;

/// Errors raised by the container backend drivers.
#[derive(Debug)]
pub enum BackendError {
    /// The container runtime binary is missing or not responding.
    RuntimeNotAvailable(String),
    /// An image build was attempted and failed.
    BuildFailed(String),
    /// A container could not be created or started.
    StartFailed(String),
    /// A runtime command exited with a failure status.
    CommandFailed { command: String, detail: String },
    /// The container is not attached to the requested network.
    NotAttached { container: String, network: String },
    /// The operation did not complete within the caller-supplied timeout.
    Timeout(String),
    IoError(std::io::Error),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::RuntimeNotAvailable(msg) => {
                write!(f, "container runtime is not available: {}", msg)
            }
            BackendError::BuildFailed(msg) => write!(f, "image build failed: {}", msg),
            BackendError::StartFailed(msg) => write!(f, "container start failed: {}", msg),
            BackendError::CommandFailed { command, detail } => {
                write!(f, "{} failed: {}", command, detail)
            }
            BackendError::NotAttached { container, network } => {
                write!(f, "container {} is not attached to network {}", container, network)
            }
            BackendError::Timeout(what) => write!(f, "timed out waiting for {}", what),
            BackendError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::IoError(err)
    }
}

/// Errors raised while discovering and building client or simulator images.
#[derive(Debug)]
pub enum RegistryError {
    /// No usable definition directories were found under the given root.
    NoDefinitions(PathBuf),
    /// Building the image for a definition failed.
    Build { name: String, source: BackendError },
    /// A `hive.yaml` metadata file could not be parsed.
    InvalidMetadata { name: String, detail: String },
    IoError(std::io::Error),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NoDefinitions(root) => {
                write!(f, "no definitions found under {}", root.display())
            }
            RegistryError::Build { name, source } => {
                write!(f, "building {}: {}", name, source)
            }
            RegistryError::InvalidMetadata { name, detail } => {
                write!(f, "invalid metadata for {}: {}", name, detail)
            }
            RegistryError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::IoError(err)
    }
}

/// Errors raised by the lifecycle manager.
///
/// `Unknown*` covers both ids that were never allocated and ids whose
/// owner is no longer live; both are rejected the same way at the API.
#[derive(Debug)]
pub enum LifecycleError {
    UnknownSuite(u32),
    UnknownTest(u32),
    UnknownNode(String),
    UnknownNetwork(String),
    UnknownClientType(String),
    MissingClientParameter,
    /// Attempt to create or act on one of the reserved names
    /// (`bridge`, `simulation`) in a way the API forbids.
    ReservedName(String),
    DuplicateNetwork(String),
    /// A script run inside the container exited non-zero.
    ScriptFailed { container: String, exit_code: i32 },
    Backend(BackendError),
    Results(std::io::Error),
}

impl LifecycleError {
    /// True when the failure was caused by simulator input rather than the
    /// backend; such errors mutate no state and map to HTTP 4xx.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            LifecycleError::Backend(_)
                | LifecycleError::Results(_)
                | LifecycleError::ScriptFailed { .. }
        )
    }
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::UnknownSuite(id) => write!(f, "unknown test suite {}", id),
            LifecycleError::UnknownTest(id) => write!(f, "unknown test case {}", id),
            LifecycleError::UnknownNode(id) => write!(f, "unknown node {}", id),
            LifecycleError::UnknownNetwork(name) => write!(f, "unknown network {}", name),
            LifecycleError::UnknownClientType(name) => write!(f, "unknown client type {}", name),
            LifecycleError::MissingClientParameter => write!(f, "missing 'CLIENT' parameter"),
            LifecycleError::ReservedName(name) => write!(f, "{} is a reserved name", name),
            LifecycleError::DuplicateNetwork(name) => {
                write!(f, "network {} already exists in this suite", name)
            }
            LifecycleError::ScriptFailed { container, exit_code } => {
                write!(f, "script in container {} exited with code {}", container, exit_code)
            }
            LifecycleError::Backend(err) => write!(f, "backend error: {}", err),
            LifecycleError::Results(err) => write!(f, "cannot write results: {}", err),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<BackendError> for LifecycleError {
    fn from(err: BackendError) -> Self {
        LifecycleError::Backend(err)
    }
}

/// Fatal host-level errors; these terminate the process with a non-zero
/// exit code regardless of any test outcomes.
#[derive(Debug)]
pub enum HostError {
    Config(String),
    Backend(BackendError),
    Registry(RegistryError),
    ResultsRoot(std::io::Error),
    Api(String),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::Config(msg) => write!(f, "configuration error: {}", msg),
            HostError::Backend(err) => write!(f, "backend unreachable: {}", err),
            HostError::Registry(err) => write!(f, "registry error: {}", err),
            HostError::ResultsRoot(err) => write!(f, "cannot prepare results root: {}", err),
            HostError::Api(msg) => write!(f, "control plane error: {}", msg),
        }
    }
}

impl std::error::Error for HostError {}

impl From<BackendError> for HostError {
    fn from(err: BackendError) -> Self {
        HostError::Backend(err)
    }
}

impl From<RegistryError> for HostError {
    fn from(err: RegistryError) -> Self {
        HostError::Registry(err)
    }
}
