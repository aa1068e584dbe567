//! State records owned by the lifecycle manager.
//!
//! Networks and nodes reference each other by id string rather than by
//! owning pointer, so suite teardown can walk both sides independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::task::JoinHandle;

use crate::lifecycle::{NodeStatus, SuiteStatus, TestStatus};

pub type SuiteID = u32;
pub type TestID = u32;

/// Name of the container runtime's default network. Never created or
/// destroyed by the host.
pub const BRIDGE_NETWORK: &str = "bridge";

/// Reserved container id resolving to the simulator container of the
/// enclosing run.
pub const SIMULATION_CONTAINER: &str = "simulation";

/// Failure details recorded on tests that were still open when their
/// suite ended.
pub const OPEN_TEST_DETAILS: &str = "suite ended with open test";

/// Outcome of a test as reported by the simulator.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub pass: bool,
    pub details: String,
}

#[derive(Debug)]
pub struct Suite {
    pub id: SuiteID,
    pub name: String,
    pub description: String,
    pub simulator_log: PathBuf,
    /// Container id of the simulator that opened this suite, used to
    /// resolve the reserved `simulation` member name.
    pub simulator_container: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SuiteStatus,
    /// Ordered by test id; ids are allocated in call order under the
    /// manager lock, so iteration yields start order.
    pub tests: BTreeMap<TestID, Test>,
    pub networks: HashMap<String, NetworkHandle>,
}

#[derive(Debug)]
pub struct Test {
    pub id: TestID,
    pub name: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TestStatus,
    pub result: Option<TestResult>,
    pub nodes: HashMap<String, Node>,
}

/// A running client container scoped to exactly one test.
#[derive(Debug)]
pub struct Node {
    pub id: String,
    pub client_type: String,
    /// Address on the default bridge network.
    pub ip: IpAddr,
    pub status: NodeStatus,
    pub env: HashMap<String, String>,
    /// Paths of the files written into the container before launch.
    pub mounts: Vec<String>,
    pub log_file: PathBuf,
    /// Task copying the container's output into `log_file`; finishes when
    /// the container exits.
    pub log_task: Option<JoinHandle<()>>,
}

/// A user-defined network scoped to a suite. The backend-side name is
/// namespaced with the host instance and suite id, so equal simulator-
/// visible names in concurrent suites never collide on the runtime.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub name: String,
    pub backend_name: String,
    pub members: HashSet<String>,
}
