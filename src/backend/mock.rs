//! In-memory backend driver for tests.
//!
//! Keeps a full inventory of containers and networks, hands out
//! deterministic addresses, counts calls, and supports scripted fault
//! injection so teardown paths can be exercised without a runtime.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::backend_trait::ContainerBackend;
use crate::backend::types::{ContainerOptions, ExecResult, LogStream, StartedContainer};
use crate::error_handling::types::BackendError;

#[derive(Debug, Clone)]
struct MockContainer {
    image: String,
    env: HashMap<String, String>,
    file_count: usize,
    networks: HashMap<String, IpAddr>,
    running: bool,
    logs: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
struct MockNetwork {
    members: Vec<String>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, MockNetwork>,
    next_container: u32,
    start_calls: usize,
    stop_calls: usize,
    exec_calls: usize,
    build_calls: usize,
    fail_start_on_call: Option<usize>,
    fail_network_removal: bool,
    exec_reply: Option<ExecResult>,
    versions: HashMap<String, String>,
    nocache_builds: Vec<String>,
    default_logs: Vec<u8>,
}

pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Makes the n-th `start_container` call (1-based) fail.
    pub fn fail_start_on_call(&self, n: usize) {
        self.state.lock().unwrap().fail_start_on_call = Some(n);
    }

    /// Makes every `remove_network` call fail.
    pub fn fail_network_removal(&self) {
        self.state.lock().unwrap().fail_network_removal = true;
    }

    pub fn set_exec_reply(&self, reply: ExecResult) {
        self.state.lock().unwrap().exec_reply = Some(reply);
    }

    pub fn set_image_version(&self, image: &str, version: &str) {
        self.state
            .lock()
            .unwrap()
            .versions
            .insert(image.to_string(), version.to_string());
    }

    pub fn set_container_logs(&self, id: &str, logs: &[u8]) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.logs = logs.to_vec();
        }
    }

    /// Output that every subsequently started container will report.
    pub fn set_default_logs(&self, logs: &[u8]) {
        self.state.lock().unwrap().default_logs = logs.to_vec();
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().unwrap().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().unwrap().stop_calls
    }

    pub fn exec_calls(&self) -> usize {
        self.state.lock().unwrap().exec_calls
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn container_image(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.image.clone())
    }

    pub fn container_env(&self, id: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.env.clone())
    }

    pub fn container_file_count(&self, id: &str) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.file_count)
    }

    pub fn network_members(&self, network: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .networks
            .get(network)
            .map(|n| n.members.clone())
    }

    pub fn builds_without_cache(&self) -> Vec<String> {
        self.state.lock().unwrap().nocache_builds.clone()
    }

    /// Simulates an abrupt container exit (the process died, the record
    /// remains until removal).
    pub fn kill_container(&self, id: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.running = false;
        }
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn build_image(
        &self,
        _context_dir: &Path,
        tag: &str,
        nocache: bool,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.build_calls += 1;
        if nocache {
            state.nocache_builds.push(tag.to_string());
        }
        Ok(tag.to_string())
    }

    async fn image_version(&self, image: &str) -> Result<Option<String>, BackendError> {
        Ok(self.state.lock().unwrap().versions.get(image).cloned())
    }

    async fn start_container(
        &self,
        image: &str,
        opts: ContainerOptions,
    ) -> Result<StartedContainer, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.start_calls += 1;
        if state.fail_start_on_call == Some(state.start_calls) {
            return Err(BackendError::StartFailed("injected start fault".to_string()));
        }

        state.next_container += 1;
        let seq = state.next_container;
        let id = format!("mock{:08x}", seq);

        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            IpAddr::V4(Ipv4Addr::new(172, 17, 0, 1 + seq as u8)),
        );
        for name in &opts.networks {
            let net = state.networks.get_mut(name).ok_or_else(|| {
                BackendError::StartFailed(format!("network {} does not exist", name))
            })?;
            net.members.push(id.clone());
            let member_no = net.members.len() as u8;
            networks.insert(
                name.clone(),
                IpAddr::V4(Ipv4Addr::new(172, 20, 0, 1 + member_no)),
            );
        }

        let default_logs = state.default_logs.clone();
        state.containers.insert(
            id.clone(),
            MockContainer {
                image: image.to_string(),
                env: opts.env,
                file_count: opts.files.len() + opts.tar_archives.len(),
                networks: networks.clone(),
                running: true,
                logs: default_logs,
            },
        );
        Ok(StartedContainer { id, ips: networks })
    }

    async fn stop_container(&self, id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.stop_calls += 1;
        state.containers.remove(id);
        for net in state.networks.values_mut() {
            net.members.retain(|m| m != id);
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, BackendError> {
        loop {
            {
                let state = self.state.lock().unwrap();
                match state.containers.get(id) {
                    Some(c) if c.running => {}
                    _ => return Ok(0),
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn inspect_ip(&self, id: &str, network: &str) -> Result<IpAddr, BackendError> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| BackendError::StartFailed(format!("no container {}", id)))?;
        container
            .networks
            .get(network)
            .copied()
            .ok_or_else(|| BackendError::NotAttached {
                container: id.to_string(),
                network: network.to_string(),
            })
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.networks.insert(name.to_string(), MockNetwork::default());
        Ok(name.to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_network_removal {
            return Err(BackendError::CommandFailed {
                command: "network rm".to_string(),
                detail: "injected network fault".to_string(),
            });
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn connect_container(&self, network: &str, id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        let next_member;
        {
            let net = state.networks.get_mut(network).ok_or_else(|| {
                BackendError::CommandFailed {
                    command: "network connect".to_string(),
                    detail: format!("network {} does not exist", network),
                }
            })?;
            if !net.members.iter().any(|m| m == id) {
                net.members.push(id.to_string());
            }
            next_member = net.members.len() as u8;
        }
        if let Some(container) = state.containers.get_mut(id) {
            container.networks.insert(
                network.to_string(),
                IpAddr::V4(Ipv4Addr::new(172, 20, 0, 1 + next_member)),
            );
        }
        Ok(())
    }

    async fn disconnect_container(&self, network: &str, id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(net) = state.networks.get_mut(network) {
            net.members.retain(|m| m != id);
        }
        if let Some(container) = state.containers.get_mut(id) {
            container.networks.remove(network);
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        _cmd: &str,
        _user: &str,
        _privileged: bool,
    ) -> Result<ExecResult, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.exec_calls += 1;
        if !state.containers.contains_key(id) {
            return Err(BackendError::CommandFailed {
                command: "exec".to_string(),
                detail: format!("no container {}", id),
            });
        }
        Ok(state.exec_reply.clone().unwrap_or(ExecResult {
            stdout: format!("enode://{:0>128}@172.17.0.2:30303\n", "ab"),
            stderr: String::new(),
            exit_code: 0,
        }))
    }

    async fn follow_logs(&self, id: &str) -> Result<LogStream, BackendError> {
        let logs = self
            .state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.logs.clone())
            .unwrap_or_default();
        Ok(Box::pin(std::io::Cursor::new(logs)))
    }

    async fn network_gateway(&self, _network: &str) -> Result<IpAddr, BackendError> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn sweep(&self, _label_key: &str) -> Result<usize, BackendError> {
        let mut state = self.state.lock().unwrap();
        let removed = state.containers.len() + state.networks.len();
        state.containers.clear();
        state.networks.clear();
        Ok(removed)
    }
}
