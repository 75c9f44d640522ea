//! Inbound tenant listener.
//!
//! Accepts TCP connections and hands each one to the proxy on its own task.
//! A stalled or failing tenant only ever affects its own task.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use spicegate_proxy::Proxy;

pub struct TenantListener {
    listener: TcpListener,
    proxy: Arc<Proxy>,
    shutdown: broadcast::Receiver<()>,
}

impl TenantListener {
    pub fn new(listener: TcpListener, proxy: Arc<Proxy>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            listener,
            proxy,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("tenant listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    tracing::debug!(%peer, "tenant connected");

                    let proxy = self.proxy.clone();
                    tokio::spawn(async move {
                        // Failures are logged by the proxy.
                        let _ = proxy.serve(stream, peer).await;
                    });
                }
            }
        }
    }
}
