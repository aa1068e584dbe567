pub mod types;

pub use types::{BackendError, HostError, LifecycleError, RegistryError};
