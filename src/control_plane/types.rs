use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use crate::lifecycle::types::SuiteID;

/// Per-simulator-run state shared with the route handlers.
///
/// The simulator container id is only known once the runner has started
/// the container, which happens after the server is already listening.
#[derive(Debug, Default)]
pub struct RunContext {
    simulator_container: OnceLock<String>,
    simulator_log: PathBuf,
    suites: Mutex<Vec<SuiteID>>,
}

impl RunContext {
    pub fn new(simulator_log: PathBuf) -> Self {
        Self {
            simulator_log,
            ..Default::default()
        }
    }

    pub fn set_simulator_container(&self, id: String) {
        let _ = self.simulator_container.set(id);
    }

    pub fn simulator_container(&self) -> Option<String> {
        self.simulator_container.get().cloned()
    }

    /// Log path recorded on suites of this run. Falls back to the
    /// simulator-supplied value when the runner did not set one.
    pub fn suite_log_path(&self, requested: &str) -> PathBuf {
        if self.simulator_log.as_os_str().is_empty() {
            PathBuf::from(requested)
        } else {
            self.simulator_log.clone()
        }
    }

    pub fn register_suite(&self, suite: SuiteID) {
        self.suites.lock().unwrap_or_else(|e| e.into_inner()).push(suite);
    }

    /// Suites opened through this run's server, in creation order.
    pub fn suites(&self) -> Vec<SuiteID> {
        self.suites.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Query parameters of the exec endpoint.
#[derive(Debug, Deserialize)]
pub struct ExecQuery {
    pub cmd: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub privileged: bool,
}

/// Body of a suite or test start request, as sent by JSON-speaking SDKs.
#[derive(Debug, Default, Deserialize)]
pub struct TestRequestBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// The `config` multipart document some SDKs send instead of individual
/// env fields.
#[derive(Debug, Default, Deserialize)]
pub struct StartClientConfig {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}
