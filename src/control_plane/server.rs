use log::{debug, info};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::control_plane::routes;
use crate::control_plane::types::RunContext;
use crate::error_handling::types::HostError;
use crate::lifecycle::TestManager;

/// A control plane server bound for one simulator run.
///
/// Binds an ephemeral port on the given host address; the resulting URL is
/// what the simulator receives as `HIVE_SIMULATOR`.
pub struct ControlServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ControlServer {
    pub fn start(
        manager: Arc<TestManager>,
        ctx: Arc<RunContext>,
        host: IpAddr,
    ) -> Result<Self, HostError> {
        let api = routes::api(manager, ctx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (addr, serve) = warp::serve(api)
            .try_bind_with_graceful_shutdown((host, 0), async move {
                let _ = shutdown_rx.await;
            })
            .map_err(|e| HostError::Api(e.to_string()))?;

        info!("control plane listening on {}", addr);
        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            task: tokio::spawn(serve),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
        debug!("control plane on {} stopped", self.addr);
    }
}
