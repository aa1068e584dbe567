use futures_util::future::join_all;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::backend::{ContainerBackend, ContainerOptions};
use crate::control_plane::{ControlServer, RunContext};
use crate::lifecycle::TestManager;
use crate::registry::SimulatorDefinition;
use crate::results::ResultWriter;

const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Address the control plane binds on; must be reachable from inside
    /// simulator containers.
    pub api_host: IpAddr,
    /// Wall-clock deadline for a whole simulator run.
    pub suite_timeout: Duration,
    /// Client-container cap exported to simulators as `HIVE_PARALLELISM`.
    pub parallelism: usize,
    /// Optional test name filter exported as `HIVE_TEST_PATTERN`.
    pub test_pattern: Option<String>,
    pub loglevel: u8,
}

pub struct SimulatorRunner {
    manager: Arc<TestManager>,
    backend: Arc<dyn ContainerBackend>,
    writer: ResultWriter,
    config: RunnerConfig,
}

impl SimulatorRunner {
    pub fn new(
        manager: Arc<TestManager>,
        backend: Arc<dyn ContainerBackend>,
        writer: ResultWriter,
        config: RunnerConfig,
    ) -> Self {
        Self {
            manager,
            backend,
            writer,
            config,
        }
    }

    /// Runs every selected simulator. Runs execute concurrently; each one
    /// talks to its own control-plane server instance.
    pub async fn run_all(&self, simulators: &[SimulatorDefinition]) {
        join_all(simulators.iter().map(|sim| self.run_one(sim))).await;
    }

    async fn run_one(&self, sim: &SimulatorDefinition) {
        info!("running simulator {}", sim.name);
        let log_path = self.writer.simulator_log_path(&sim.name);
        let ctx = Arc::new(RunContext::new(log_path.clone()));

        let server = match ControlServer::start(self.manager.clone(), ctx.clone(), self.config.api_host)
        {
            Ok(server) => server,
            Err(e) => {
                error!("cannot start control plane for {}: {}", sim.name, e);
                return;
            }
        };

        let mut env = HashMap::new();
        env.insert("HIVE_SIMULATOR".to_string(), server.url());
        env.insert(
            "HIVE_PARALLELISM".to_string(),
            self.config.parallelism.to_string(),
        );
        env.insert("HIVE_LOGLEVEL".to_string(), self.config.loglevel.to_string());
        if let Some(ref pattern) = self.config.test_pattern {
            env.insert("HIVE_TEST_PATTERN".to_string(), pattern.clone());
        }

        let opts = ContainerOptions {
            env,
            ..Default::default()
        };
        let started = match self.backend.start_container(&sim.image, opts).await {
            Ok(started) => started,
            Err(e) => {
                error!("cannot start simulator {}: {}", sim.name, e);
                server.stop().await;
                return;
            }
        };
        ctx.set_simulator_container(started.id.clone());
        let log_task = self.follow_to_file(&started.id, log_path).await;

        match tokio::time::timeout(
            self.config.suite_timeout,
            self.backend.wait_container(&started.id),
        )
        .await
        {
            Ok(Ok(code)) => {
                // The exit code is informational; authoritative results
                // are the per-test verdicts the simulator reported.
                info!("simulator {} exited with code {}", sim.name, code);
            }
            Ok(Err(e)) => warn!("waiting for simulator {} failed: {}", sim.name, e),
            Err(_) => {
                warn!(
                    "simulator {} exceeded its {}s deadline, killing it",
                    sim.name,
                    self.config.suite_timeout.as_secs()
                );
            }
        }
        if let Err(e) = self.backend.stop_container(&started.id).await {
            warn!("cannot remove simulator container {}: {}", started.id, e);
        }
        if let Some(mut task) = log_task {
            if tokio::time::timeout(LOG_FLUSH_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        // Whatever the simulator left open is force-ended now; open tests
        // get the auto-generated failure result.
        for suite in ctx.suites() {
            if let Err(e) = self.manager.end_suite(suite).await {
                warn!("cannot end suite {} of {}: {}", suite, sim.name, e);
            }
        }

        server.stop().await;
        info!("simulator {} done", sim.name);
    }

    async fn follow_to_file(&self, container: &str, path: PathBuf) -> Option<JoinHandle<()>> {
        match self.backend.follow_logs(container).await {
            Ok(mut stream) => Some(tokio::spawn(async move {
                match tokio::fs::File::create(&path).await {
                    Ok(mut file) => {
                        if let Err(e) = tokio::io::copy(&mut stream, &mut file).await {
                            debug!("simulator log stream broke: {}", e);
                        }
                        let _ = file.flush().await;
                    }
                    Err(e) => warn!("cannot create simulator log {}: {}", path.display(), e),
                }
            })),
            Err(e) => {
                warn!("cannot follow simulator container {}: {}", container, e);
                None
            }
        }
    }
}
