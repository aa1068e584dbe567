//! Core types used by the container backend subsystem.

use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Label key attached to every container and network the host creates.
/// Startup crash recovery sweeps the runtime for this key.
pub const INSTANCE_LABEL: &str = "hive.instance";

/// Launch parameters for a new container.
#[derive(Debug, Default)]
pub struct ContainerOptions {
    /// Environment variables injected into the container.
    pub env: HashMap<String, String>,
    /// Files written into the container before the entrypoint runs,
    /// keyed by absolute path inside the container.
    pub files: HashMap<String, Vec<u8>>,
    /// Raw tar archives unpacked at the container root before start.
    pub tar_archives: Vec<Vec<u8>>,
    /// Networks to attach in addition to the runtime's default bridge.
    pub networks: Vec<String>,
}

/// Result of a successful container start.
#[derive(Debug, Clone)]
pub struct StartedContainer {
    /// Backend-assigned container id.
    pub id: String,
    /// Assigned address per attached network name.
    pub ips: HashMap<String, IpAddr>,
}

/// Captured output of a command executed inside a container.
///
/// The serialized form matches the control plane's exec reply body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecResult {
    #[serde(rename = "out")]
    pub stdout: String,
    #[serde(rename = "err")]
    pub stderr: String,
    #[serde(rename = "code")]
    pub exit_code: i32,
}

/// Byte stream of a container's combined stdout/stderr. Ends when the
/// container exits.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;
