//! Accept loop and shutdown sequence

use crate::connection::{Connection, ConnectionContext, WorkerHandle};
use crate::error::{is_disconnect, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of waits for workers to finish during shutdown
const SHUTDOWN_ATTEMPTS: u32 = 10;

/// The proxy listener on the loopback interface
pub struct Server {
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    shutdown_wait: Duration,
}

impl Server {
    /// Bind `127.0.0.1:<listen_port>`; port 0 picks a free port
    pub async fn bind(context: Arc<ConnectionContext>) -> Result<Self> {
        let port = context.config.current().listen_port;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(Server {
            listener,
            context,
            shutdown_wait: Duration::from_secs(10),
        })
    }

    /// Set how long each shutdown attempt waits for workers
    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled, then stop all workers
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut live: HashMap<u64, WorkerHandle> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        debug!("connection {} from {}", next_id, peer);
                        self.context.metrics.record_connection();
                        let (connection, handle) =
                            Connection::new(next_id, stream, Arc::clone(&self.context));
                        live.insert(next_id, handle);
                        workers.spawn(connection.run(done_tx.clone()));
                    }
                    Err(e) if is_disconnect(&e) => debug!("accept: {}", e),
                    Err(e) => {
                        error!("accept failed: {}", e);
                        break;
                    }
                },
                Some(id) = done_rx.recv() => {
                    if live.remove(&id).is_none() {
                        warn!("internal error: live worker mismatch: {}", id);
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        warn!("connection worker failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        drop(self.listener);
        stop_workers(live, workers, self.shutdown_wait).await;
        Ok(())
    }
}

/// Stop every live worker and wait for them, aborting after the first wait
async fn stop_workers(live: HashMap<u64, WorkerHandle>, mut workers: JoinSet<()>, wait: Duration) {
    info!("Stopping {} connections", live.len());
    for handle in live.values() {
        handle.stop();
    }

    for attempt in 1..=SHUTDOWN_ATTEMPTS {
        let drained = tokio::time::timeout(wait, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if drained {
            info!("All connections closed");
            return;
        }
        warn!(
            "Waiting for {} connections ({}/{})",
            workers.len(),
            attempt,
            SHUTDOWN_ATTEMPTS
        );
        workers.abort_all();
    }
    error!("{} connections did not stop", workers.len());
}
