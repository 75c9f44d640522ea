//! Proxy coordinator. Drives a tenant handshake to completion under
//! per-step deadlines, then splices tenant and compute host together.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use spicegate_services::framer::write_raw;
use spicegate_services::{AuthRegistry, SessionStore, TenantStream};

use crate::error::HandshakeError;
use crate::handshake::{ComputeLink, TenantHandshake};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake counters, shared with the status API.
#[derive(Debug, Default)]
pub struct ProxyStats {
    accepted: AtomicU64,
    established: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub established: u64,
    pub failed: u64,
    /// Connections currently spliced.
    pub active: u64,
}

impl ProxyStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            established: self.established.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Holds one count in `ProxyStats::active` until dropped, including when
/// the serving task is cancelled mid-splice.
struct ActiveGuard<'a>(&'a ProxyStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a ProxyStats) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Proxy {
    registry: Arc<AuthRegistry>,
    sessions: Arc<dyn SessionStore>,
    step_timeout: Duration,
    stats: Arc<ProxyStats>,
}

impl Proxy {
    pub fn new(registry: Arc<AuthRegistry>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            registry,
            sessions,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            stats: Arc::new(ProxyStats::default()),
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        self.stats.clone()
    }

    /// Run both handshakes for one tenant connection.
    ///
    /// Returns the compute connection once the session is registered. On
    /// error nothing has been registered and the compute connection, if any,
    /// is closed.
    pub async fn run_tenant_handshake<T: TenantStream>(
        &self,
        tenant: &mut T,
    ) -> Result<ComputeLink, HandshakeError> {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let result = self.drive(tenant).await;
        match &result {
            Ok(_) => self.stats.established.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn drive<T: TenantStream>(&self, tenant: &mut T) -> Result<ComputeLink, HandshakeError> {
        let mut handshake = TenantHandshake::new(tenant, self.registry.clone(), self.sessions.clone());
        while !handshake.is_done() {
            let stepped = timeout(self.step_timeout, handshake.step()).await;
            match stepped {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(state = ?handshake.state(), "handshake step timed out");
                    handshake.abort();
                    return Err(HandshakeError::Timeout(self.step_timeout));
                }
            }
        }
        handshake.take_link().ok_or(HandshakeError::Terminated)
    }

    /// Handshake, then relay bytes both ways until either side closes.
    pub async fn serve<T: TenantStream>(&self, mut tenant: T, peer: SocketAddr) -> Result<(), HandshakeError> {
        let link = match self.run_tenant_handshake(&mut tenant).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "handshake failed");
                return Err(e);
            }
        };

        let ComputeLink {
            stream: mut compute,
            session_id,
            forward,
        } = link;
        if !forward.is_empty() {
            write_raw(&mut tenant, &forward).await?;
        }

        let spliced = {
            let _active = ActiveGuard::enter(&self.stats);
            tokio::io::copy_bidirectional(&mut tenant, &mut compute).await
        };

        match spliced {
            Ok((to_compute, to_tenant)) => {
                tracing::info!(%peer, session_id, to_compute, to_tenant, "connection closed");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(%peer, session_id, error = %e, "relay ended with error");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("registry", &self.registry)
            .field("step_timeout", &self.step_timeout)
            .finish_non_exhaustive()
    }
}
