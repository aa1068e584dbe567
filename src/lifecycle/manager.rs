use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::backend::{ContainerBackend, ContainerOptions, ExecResult};
use crate::error_handling::types::{BackendError, LifecycleError};
use crate::lifecycle::types::{
    NetworkHandle, Node, Suite, SuiteID, Test, TestID, TestResult, BRIDGE_NETWORK,
    OPEN_TEST_DETAILS, SIMULATION_CONTAINER,
};
use crate::lifecycle::{NodeStatus, SuiteStatus, TestStatus};
use crate::registry::ClientDefinition;
use crate::results::types::{SuiteReport, TestCaseReport};
use crate::results::ResultWriter;

/// How long to wait for a node's log capture task to drain after the
/// container was stopped.
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// The stateful heart of the host.
///
/// All observable state lives behind one coarse mutex. The lock is never
/// held across backend I/O: operations validate and reserve under the
/// lock, run the backend work unlocked, then reacquire to commit or roll
/// back. This linearizes state changes while container operations from
/// concurrent suites proceed in parallel.
pub struct TestManager {
    backend: Arc<dyn ContainerBackend>,
    clients: Vec<ClientDefinition>,
    writer: ResultWriter,
    instance: String,
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    suites: HashMap<SuiteID, Suite>,
    next_suite: SuiteID,
    next_test: TestID,
}

impl TestManager {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        clients: Vec<ClientDefinition>,
        writer: ResultWriter,
        instance: String,
    ) -> Self {
        Self {
            backend,
            clients,
            writer,
            instance,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Client types available to simulators in this run.
    pub fn client_definitions(&self) -> Vec<ClientDefinition> {
        self.clients.clone()
    }

    pub fn suite_status(&self, suite: SuiteID) -> Option<SuiteStatus> {
        self.state().suites.get(&suite).map(|s| s.status)
    }

    /// Test ids of a suite in start order.
    pub fn test_ids(&self, suite: SuiteID) -> Option<Vec<TestID>> {
        self.state()
            .suites
            .get(&suite)
            .map(|s| s.tests.keys().copied().collect())
    }

    pub fn node_status(&self, suite: SuiteID, test: TestID, node: &str) -> Option<NodeStatus> {
        self.state()
            .suites
            .get(&suite)
            .and_then(|s| s.tests.get(&test))
            .and_then(|t| t.nodes.get(node))
            .map(|n| n.status)
    }

    // ---- suites -----------------------------------------------------

    pub fn start_suite(
        &self,
        name: String,
        description: String,
        simulator_log: PathBuf,
        simulator_container: Option<String>,
    ) -> SuiteID {
        let mut state = self.state();
        let id = state.next_suite;
        state.next_suite += 1;
        state.suites.insert(
            id,
            Suite {
                id,
                name: name.clone(),
                description,
                simulator_log,
                simulator_container,
                started_at: Utc::now(),
                ended_at: None,
                status: SuiteStatus::Open,
                tests: BTreeMap::new(),
                networks: HashMap::new(),
            },
        );
        info!("suite {} started ({})", id, name);
        id
    }

    /// Tears down everything the suite owns and writes its report.
    ///
    /// Teardown order: nodes of all tests (logs flushed first), then the
    /// suite's networks, then the record is frozen. Individual backend
    /// failures are logged and do not stop the sweep. A second call on
    /// the same suite is a no-op.
    pub async fn end_suite(&self, suite: SuiteID) -> Result<(), LifecycleError> {
        let (nodes, networks) = {
            let mut state = self.state();
            let record = match state.suites.get_mut(&suite) {
                Some(s) => s,
                None => return Err(LifecycleError::UnknownSuite(suite)),
            };
            match record.status {
                SuiteStatus::Open => {}
                // Already torn down (or being torn down by another call).
                SuiteStatus::Closing | SuiteStatus::Written => return Ok(()),
            }
            record.status = SuiteStatus::Closing;

            let mut nodes = Vec::new();
            for test in record.tests.values_mut() {
                if test.status == TestStatus::Open {
                    test.status = TestStatus::Closed;
                    test.ended_at = Some(Utc::now());
                    test.result = Some(TestResult {
                        pass: false,
                        details: OPEN_TEST_DETAILS.to_string(),
                    });
                    debug!("suite {}: force-closing open test {}", suite, test.id);
                }
                for node in test.nodes.values_mut() {
                    if node.status != NodeStatus::Gone {
                        node.status = NodeStatus::Stopping;
                        nodes.push((node.id.clone(), node.log_task.take()));
                    }
                }
            }
            let networks: Vec<NetworkHandle> = record.networks.values().cloned().collect();
            (nodes, networks)
        };

        for (id, log_task) in nodes {
            self.teardown_node(&id, log_task).await;
        }
        for handle in &networks {
            for member in &handle.members {
                if let Err(e) = self
                    .backend
                    .disconnect_container(&handle.backend_name, member)
                    .await
                {
                    warn!(
                        "suite {}: cannot detach {} from {}: {}",
                        suite, member, handle.name, e
                    );
                }
            }
            if let Err(e) = self.backend.remove_network(&handle.backend_name).await {
                warn!("suite {}: cannot remove network {}: {}", suite, handle.name, e);
            }
        }

        let (report, started_at) = {
            let mut state = self.state();
            let record = match state.suites.get_mut(&suite) {
                Some(s) => s,
                None => return Err(LifecycleError::UnknownSuite(suite)),
            };
            for test in record.tests.values_mut() {
                for node in test.nodes.values_mut() {
                    node.status = NodeStatus::Gone;
                }
            }
            record.networks.clear();
            record.ended_at = Some(Utc::now());
            record.status = SuiteStatus::Written;
            (self.build_report(record), record.started_at)
        };

        self.writer
            .write_suite(suite, started_at, &report)
            .map_err(LifecycleError::Results)?;
        info!("suite {} ended", suite);
        Ok(())
    }

    fn build_report(&self, suite: &Suite) -> SuiteReport {
        let client_versions = self
            .clients
            .iter()
            .map(|c| (c.name.clone(), c.version.clone()))
            .collect();
        let test_cases = suite
            .tests
            .values()
            .map(|test| {
                (
                    test.id,
                    TestCaseReport {
                        name: test.name.clone(),
                        description: test.description.clone(),
                        start: test.started_at,
                        end: test.ended_at.unwrap_or(test.started_at),
                        summary_result: test.result.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();
        SuiteReport {
            name: suite.name.clone(),
            description: suite.description.clone(),
            client_versions,
            test_cases,
        }
    }

    // ---- tests ------------------------------------------------------

    pub fn start_test(
        &self,
        suite: SuiteID,
        name: String,
        description: String,
    ) -> Result<TestID, LifecycleError> {
        let mut state = self.state();
        let id = state.next_test;
        let record = live_suite(&mut state, suite)?;
        record.tests.insert(
            id,
            Test {
                id,
                name,
                description,
                started_at: Utc::now(),
                ended_at: None,
                status: TestStatus::Open,
                result: None,
                nodes: HashMap::new(),
            },
        );
        state.next_test = id + 1;
        debug!("suite {}: test {} started", suite, id);
        Ok(id)
    }

    /// Records the result and stops every node the test owns. Calling it
    /// again on an already-closed test (while the suite is live) keeps
    /// the first result and succeeds.
    pub async fn end_test(
        &self,
        suite: SuiteID,
        test: TestID,
        result: TestResult,
    ) -> Result<(), LifecycleError> {
        let nodes = {
            let mut state = self.state();
            let record = live_suite(&mut state, suite)?;
            let test_record = match record.tests.get_mut(&test) {
                Some(t) => t,
                None => return Err(LifecycleError::UnknownTest(test)),
            };
            if test_record.status == TestStatus::Closed {
                return Ok(());
            }
            test_record.status = TestStatus::Closed;
            test_record.ended_at = Some(Utc::now());
            test_record.result = Some(result);

            let mut nodes = Vec::new();
            for node in test_record.nodes.values_mut() {
                if node.status != NodeStatus::Gone {
                    node.status = NodeStatus::Stopping;
                    nodes.push((node.id.clone(), node.log_task.take()));
                }
            }
            nodes
        };

        for (id, log_task) in nodes {
            self.teardown_node(&id, log_task).await;
            let mut state = self.state();
            if let Some(node) = state
                .suites
                .get_mut(&suite)
                .and_then(|s| s.tests.get_mut(&test))
                .and_then(|t| t.nodes.get_mut(&id))
            {
                node.status = NodeStatus::Gone;
            }
        }
        debug!("suite {}: test {} ended", suite, test);
        Ok(())
    }

    // ---- nodes ------------------------------------------------------

    /// Starts a client container for a test. The `CLIENT` parameter picks
    /// the client type; `HIVE_CLIENT_NETWORK` additionally attaches the
    /// container to an existing suite network. All parameters are
    /// forwarded verbatim as container environment.
    pub async fn start_client(
        &self,
        suite: SuiteID,
        test: TestID,
        params: HashMap<String, String>,
        files: HashMap<String, Vec<u8>>,
        tar_archives: Vec<Vec<u8>>,
    ) -> Result<(String, IpAddr), LifecycleError> {
        let client_network = params.get("HIVE_CLIENT_NETWORK").cloned();
        let (image, client_type, extra_networks) = {
            let mut state = self.state();
            let record = live_suite(&mut state, suite)?;

            let client_type = match params.get("CLIENT") {
                Some(name) => name.clone(),
                None => return Err(LifecycleError::MissingClientParameter),
            };
            let definition = match self.clients.iter().find(|c| c.name == client_type) {
                Some(d) => d,
                None => return Err(LifecycleError::UnknownClientType(client_type)),
            };

            let mut extra = Vec::new();
            if let Some(ref net) = client_network {
                match record.networks.get(net) {
                    Some(handle) => extra.push(handle.backend_name.clone()),
                    None => return Err(LifecycleError::UnknownNetwork(net.clone())),
                }
            }

            match record.tests.get(&test) {
                Some(t) if t.status == TestStatus::Open => {}
                _ => return Err(LifecycleError::UnknownTest(test)),
            }
            (definition.image.clone(), client_type, extra)
        };

        let mounts: Vec<String> = files.keys().cloned().collect();
        let opts = ContainerOptions {
            env: params.clone(),
            files,
            tar_archives,
            networks: extra_networks,
        };
        let started = self
            .backend
            .start_container(&image, opts)
            .await
            .map_err(LifecycleError::Backend)?;

        if started.id == SIMULATION_CONTAINER {
            // A backend must never hand out the reserved member name.
            let _ = self.backend.stop_container(&started.id).await;
            return Err(LifecycleError::ReservedName(SIMULATION_CONTAINER.to_string()));
        }
        let ip = match started.ips.get(BRIDGE_NETWORK) {
            Some(ip) => *ip,
            None => {
                let _ = self.backend.stop_container(&started.id).await;
                return Err(LifecycleError::Backend(BackendError::StartFailed(format!(
                    "container {} has no bridge address",
                    started.id
                ))));
            }
        };

        let log_file = self.writer.node_log_path(&started.id);
        let log_task = self.capture_logs(&started.id, log_file.clone()).await;
        let node = Node {
            id: started.id.clone(),
            client_type: client_type.clone(),
            ip,
            status: NodeStatus::Running,
            env: params,
            mounts,
            log_file,
            log_task,
        };

        let commit = {
            let mut state = self.state();
            commit_node(&mut state, suite, test, &client_network, node)
        };
        match commit {
            Ok(()) => {
                info!(
                    "suite {}: client {} started as {} ({})",
                    suite, client_type, started.id, ip
                );
                Ok((started.id, ip))
            }
            Err((err, mut node)) => {
                // The test or suite went away while the container was
                // starting; release the backend resource before replying.
                warn!(
                    "suite {}: releasing container {} started for dead test {}",
                    suite, started.id, test
                );
                self.teardown_node(&started.id, node.log_task.take()).await;
                Err(err)
            }
        }
    }

    /// Force-stops a node. Stopping a node that is already gone succeeds.
    pub async fn stop_client(
        &self,
        suite: SuiteID,
        test: TestID,
        node: &str,
    ) -> Result<(), LifecycleError> {
        let log_task = {
            let mut state = self.state();
            let record = live_suite(&mut state, suite)?;
            let test_record = match record.tests.get_mut(&test) {
                Some(t) => t,
                None => return Err(LifecycleError::UnknownTest(test)),
            };
            let node_record = match test_record.nodes.get_mut(node) {
                Some(n) => n,
                None => return Err(LifecycleError::UnknownNode(node.to_string())),
            };
            if node_record.status == NodeStatus::Gone {
                return Ok(());
            }
            node_record.status = NodeStatus::Stopping;
            node_record.log_task.take()
        };

        let stop_result = self.backend.stop_container(node).await;
        self.flush_log_task(node, log_task).await;

        let mut state = self.state();
        if let Some(node_record) = state
            .suites
            .get_mut(&suite)
            .and_then(|s| s.tests.get_mut(&test))
            .and_then(|t| t.nodes.get_mut(node))
        {
            node_record.status = NodeStatus::Gone;
        }
        drop(state);
        stop_result.map_err(LifecycleError::Backend)
    }

    /// Runs the client's `/enode.sh` and returns its trimmed stdout.
    pub async fn client_enode_url(
        &self,
        suite: SuiteID,
        test: TestID,
        node: &str,
    ) -> Result<String, LifecycleError> {
        let result = self.run_program(suite, test, node, "/enode.sh", "", false).await?;
        if result.exit_code != 0 {
            return Err(LifecycleError::ScriptFailed {
                container: node.to_string(),
                exit_code: result.exit_code,
            });
        }
        Ok(result.stdout.trim_end_matches(&['\r', '\n'][..]).to_string())
    }

    pub async fn run_program(
        &self,
        suite: SuiteID,
        test: TestID,
        node: &str,
        cmd: &str,
        user: &str,
        privileged: bool,
    ) -> Result<ExecResult, LifecycleError> {
        {
            let mut state = self.state();
            let record = live_suite(&mut state, suite)?;
            let running = record
                .tests
                .get(&test)
                .ok_or(LifecycleError::UnknownTest(test))?
                .nodes
                .get(node)
                .map(|n| n.status == NodeStatus::Running)
                .unwrap_or(false);
            if !running {
                return Err(LifecycleError::UnknownNode(node.to_string()));
            }
        }
        self.backend
            .exec(node, cmd, user, privileged)
            .await
            .map_err(LifecycleError::Backend)
    }

    // ---- networks ---------------------------------------------------

    pub async fn create_network(&self, suite: SuiteID, name: &str) -> Result<(), LifecycleError> {
        if name == BRIDGE_NETWORK {
            return Err(LifecycleError::ReservedName(BRIDGE_NETWORK.to_string()));
        }
        let backend_name = {
            let mut state = self.state();
            let record = live_suite(&mut state, suite)?;
            if record.networks.contains_key(name) {
                return Err(LifecycleError::DuplicateNetwork(name.to_string()));
            }
            let backend_name = format!(
                "hive-{}-{}-{}",
                &self.instance[..self.instance.len().min(8)],
                suite,
                name
            );
            // Reserve the slot so a concurrent create of the same name
            // fails as a duplicate instead of racing on the backend.
            record.networks.insert(
                name.to_string(),
                NetworkHandle {
                    name: name.to_string(),
                    backend_name: backend_name.clone(),
                    members: Default::default(),
                },
            );
            backend_name
        };

        match self.backend.create_network(&backend_name).await {
            Ok(_) => {
                debug!("suite {}: network {} created as {}", suite, name, backend_name);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state();
                if let Some(record) = state.suites.get_mut(&suite) {
                    record.networks.remove(name);
                }
                Err(LifecycleError::Backend(e))
            }
        }
    }

    pub async fn remove_network(&self, suite: SuiteID, name: &str) -> Result<(), LifecycleError> {
        if name == BRIDGE_NETWORK {
            return Err(LifecycleError::ReservedName(BRIDGE_NETWORK.to_string()));
        }
        let handle = {
            let mut state = self.state();
            let record = live_suite(&mut state, suite)?;
            match record.networks.get(name) {
                Some(h) => h.clone(),
                None => return Err(LifecycleError::UnknownNetwork(name.to_string())),
            }
        };

        for member in &handle.members {
            if let Err(e) = self
                .backend
                .disconnect_container(&handle.backend_name, member)
                .await
            {
                warn!("cannot detach {} from {}: {}", member, name, e);
            }
        }
        self.backend
            .remove_network(&handle.backend_name)
            .await
            .map_err(LifecycleError::Backend)?;

        let mut state = self.state();
        if let Some(record) = state.suites.get_mut(&suite) {
            record.networks.remove(name);
        }
        Ok(())
    }

    pub async fn connect_container(
        &self,
        suite: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<(), LifecycleError> {
        let (backend_name, resolved) = self.resolve_network_member(suite, name, container)?;
        self.backend
            .connect_container(&backend_name, &resolved)
            .await
            .map_err(LifecycleError::Backend)?;

        if name != BRIDGE_NETWORK {
            let mut state = self.state();
            if let Some(handle) = state
                .suites
                .get_mut(&suite)
                .and_then(|s| s.networks.get_mut(name))
            {
                handle.members.insert(resolved);
            }
        }
        Ok(())
    }

    pub async fn disconnect_container(
        &self,
        suite: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<(), LifecycleError> {
        let (backend_name, resolved) = self.resolve_network_member(suite, name, container)?;
        self.backend
            .disconnect_container(&backend_name, &resolved)
            .await
            .map_err(LifecycleError::Backend)?;

        if name != BRIDGE_NETWORK {
            let mut state = self.state();
            if let Some(handle) = state
                .suites
                .get_mut(&suite)
                .and_then(|s| s.networks.get_mut(name))
            {
                handle.members.remove(&resolved);
            }
        }
        Ok(())
    }

    pub async fn container_network_ip(
        &self,
        suite: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<IpAddr, LifecycleError> {
        let (backend_name, resolved) = self.resolve_network_member(suite, name, container)?;
        self.backend
            .inspect_ip(&resolved, &backend_name)
            .await
            .map_err(LifecycleError::Backend)
    }

    /// Resolves the reserved names at the API boundary: network `bridge`
    /// is the runtime default, container `simulation` is the simulator of
    /// the enclosing run. Other containers must belong to the suite.
    fn resolve_network_member(
        &self,
        suite: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<(String, String), LifecycleError> {
        let mut state = self.state();
        let record = live_suite(&mut state, suite)?;

        let backend_name = if name == BRIDGE_NETWORK {
            BRIDGE_NETWORK.to_string()
        } else {
            match record.networks.get(name) {
                Some(h) => h.backend_name.clone(),
                None => return Err(LifecycleError::UnknownNetwork(name.to_string())),
            }
        };

        let resolved = if container == SIMULATION_CONTAINER {
            match record.simulator_container {
                Some(ref id) => id.clone(),
                None => return Err(LifecycleError::UnknownNode(container.to_string())),
            }
        } else {
            let known = record.tests.values().any(|t| {
                t.nodes
                    .get(container)
                    .map(|n| n.status != NodeStatus::Gone)
                    .unwrap_or(false)
            });
            if !known {
                return Err(LifecycleError::UnknownNode(container.to_string()));
            }
            container.to_string()
        };
        Ok((backend_name, resolved))
    }

    // ---- teardown helpers -------------------------------------------

    async fn teardown_node(&self, id: &str, log_task: Option<JoinHandle<()>>) {
        if let Err(e) = self.backend.stop_container(id).await {
            warn!("cannot stop container {}: {}", id, e);
        }
        self.flush_log_task(id, log_task).await;
    }

    /// The capture task finishes on its own once the container exits;
    /// give it a moment to drain, then cut it loose.
    async fn flush_log_task(&self, id: &str, log_task: Option<JoinHandle<()>>) {
        if let Some(mut task) = log_task {
            if tokio::time::timeout(LOG_FLUSH_TIMEOUT, &mut task).await.is_err() {
                debug!("log capture for {} did not drain in time", id);
                task.abort();
            }
        }
    }

    async fn capture_logs(&self, container: &str, path: PathBuf) -> Option<JoinHandle<()>> {
        match self.backend.follow_logs(container).await {
            Ok(mut stream) => Some(tokio::spawn(async move {
                match tokio::fs::File::create(&path).await {
                    Ok(mut file) => {
                        if let Err(e) = tokio::io::copy(&mut stream, &mut file).await {
                            debug!("log stream for {} broke: {}", path.display(), e);
                        }
                        let _ = file.flush().await;
                    }
                    Err(e) => warn!("cannot create log file {}: {}", path.display(), e),
                }
            })),
            Err(e) => {
                warn!("cannot follow logs of container {}: {}", container, e);
                None
            }
        }
    }
}

/// The suite must exist and still accept work.
fn live_suite<'a>(
    state: &'a mut ManagerState,
    suite: SuiteID,
) -> Result<&'a mut Suite, LifecycleError> {
    match state.suites.get_mut(&suite) {
        Some(s) if s.status == SuiteStatus::Open => Ok(s),
        _ => Err(LifecycleError::UnknownSuite(suite)),
    }
}

/// Commit phase of `start_client`: re-checks that the test is still open
/// and files the node. Hands the node back on failure so the caller can
/// release the container.
fn commit_node(
    state: &mut ManagerState,
    suite: SuiteID,
    test: TestID,
    client_network: &Option<String>,
    node: Node,
) -> Result<(), (LifecycleError, Node)> {
    let record = match state.suites.get_mut(&suite) {
        Some(s) if s.status == SuiteStatus::Open => s,
        _ => return Err((LifecycleError::UnknownSuite(suite), node)),
    };
    let open = record
        .tests
        .get(&test)
        .map(|t| t.status == TestStatus::Open)
        .unwrap_or(false);
    if !open {
        return Err((LifecycleError::UnknownTest(test), node));
    }
    if let Some(net) = client_network {
        if let Some(handle) = record.networks.get_mut(net) {
            handle.members.insert(node.id.clone());
        }
    }
    if let Some(test_record) = record.tests.get_mut(&test) {
        test_record.nodes.insert(node.id.clone(), node);
    }
    Ok(())
}
