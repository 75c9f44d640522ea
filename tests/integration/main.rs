//! spicegate integration test harness.
//!
//! Every test runs a real relay on a loopback port in front of a scripted
//! compute host, and talks to it as a SPICE client over TCP:
//!
//!   cargo test --test integration
//!
//! Each test owns its relay and compute host; nothing is shared.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use spicegate_core::config::TicketEntry;
use spicegate_core::wire::{AuthMethod, ChannelType, ErrorCode, ServerLinkMessage, RELAY_COMMON_CAPS};
use spicegate_proxy::testing;
use spicegate_proxy::Proxy;
use spicegate_services::{new_session_table, AuthRegistry, SessionTable, TicketAuthenticator};

mod failures;
mod relay;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Size of a forwarded main init: mini header plus 32-byte body.
pub const MAIN_INIT_LEN: usize = 6 + 32;

/// A relay listening on loopback.
pub struct Relay {
    pub addr: SocketAddr,
    pub sessions: SessionTable,
    pub proxy: Arc<Proxy>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Relay {
    pub async fn start(tickets: Vec<TicketEntry>, step_timeout: Duration) -> Result<Self> {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(TicketAuthenticator::new(tickets)));

        let sessions = new_session_table();
        let proxy = Arc::new(
            Proxy::new(Arc::new(registry), sessions.clone()).with_step_timeout(step_timeout),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, mut shutdown_rx) = broadcast::channel::<()>(1);

        let task = tokio::spawn({
            let proxy = proxy.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        accepted = listener.accept() => {
                            let Ok((stream, peer)) = accepted else { continue };
                            let proxy = proxy.clone();
                            tokio::spawn(async move {
                                let _ = proxy.serve(stream, peer).await;
                            });
                        }
                    }
                }
            }
        });

        Ok(Self {
            addr,
            sessions,
            proxy,
            shutdown,
            task,
        })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        self.task.abort();
    }
}

pub fn ticket(password: &str, destination: SocketAddr) -> TicketEntry {
    TicketEntry {
        password: password.to_string(),
        destination: destination.to_string(),
        otp: None,
    }
}

/// Run a full tenant handshake with SPICE auth.
/// Returns the link reply and the ticket result.
pub async fn tenant_handshake(
    stream: &mut TcpStream,
    session_id: u32,
    channel_type: ChannelType,
    password: &str,
) -> Result<(ServerLinkMessage, ErrorCode)> {
    let reply = testing::send_link(stream, session_id, channel_type, vec![RELAY_COMMON_CAPS]).await?;
    testing::select_method(stream, AuthMethod::SPICE).await?;
    testing::send_ticket(stream, &reply, password).await?;
    let code = testing::read_ticket(stream).await?;
    Ok((reply, code))
}

/// Read until the relay closes the connection, failing after `limit`.
pub async fn read_until_closed(stream: &mut TcpStream, limit: Duration) -> Result<Vec<u8>> {
    let mut rest = Vec::new();
    tokio::time::timeout(limit, stream.read_to_end(&mut rest)).await??;
    Ok(rest)
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
