use clap::Parser;
use log::{error, info, warn};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use uuid::Uuid;

use hive::backend::{ContainerBackend, DockerBackend, INSTANCE_LABEL};
use hive::configuration::Config;
use hive::error_handling::types::HostError;
use hive::lifecycle::TestManager;
use hive::registry::ImageBuilder;
use hive::results::ResultWriter;
use hive::runner::{RunnerConfig, SimulatorRunner};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // RUST_LOG wins over --loglevel when set.
    env_logger::Builder::from_default_env()
        .filter_level(config.level_filter())
        .format_target(false)
        .init();

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), HostError> {
    let writer = ResultWriter::new(&config.results_root).map_err(HostError::ResultsRoot)?;

    let instance = Uuid::new_v4().simple().to_string();
    let backend: Arc<DockerBackend> = Arc::new(DockerBackend::new(
        config.docker_bin.clone(),
        instance.clone(),
    ));
    backend.ping().await?;

    // Clean up whatever a crashed previous host left on the runtime.
    match backend.sweep(INSTANCE_LABEL).await {
        Ok(0) => {}
        Ok(n) => info!("removed {} stale resource(s) from a previous run", n),
        Err(e) => warn!("stale resource sweep failed: {}", e),
    }

    let builder = ImageBuilder::new(backend.clone(), config.nocache_list());
    let client_filter = config.client_list();
    let clients = builder
        .build_clients(&config.clients_root, client_filter.as_deref())
        .await?;
    info!("{} client type(s) ready", clients.len());

    let sim_pattern = config.sim_pattern()?;
    let simulators = builder
        .build_simulators(&config.sims_root, sim_pattern.as_ref())
        .await?;
    info!("{} simulator(s) selected", simulators.len());

    let api_host = match config.api_host {
        Some(host) => host,
        None => match backend.network_gateway("bridge").await {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!("cannot determine bridge gateway ({}), using loopback", e);
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        },
    };

    let manager = Arc::new(TestManager::new(
        backend.clone(),
        clients,
        writer.clone(),
        instance,
    ));
    let runner = SimulatorRunner::new(
        manager,
        backend,
        writer,
        RunnerConfig {
            api_host,
            suite_timeout: config.suite_timeout(),
            parallelism: config.sim_parallelism,
            test_pattern: config.sim_test_pattern.clone(),
            loglevel: config.loglevel,
        },
    );
    runner.run_all(&simulators).await;

    info!("all simulator runs finished");
    Ok(())
}
