//! spicegated: the SPICE relay daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use spicegate_core::config::SpicegateConfig;
use spicegate_proxy::Proxy;
use spicegate_services::{new_session_table, AuthRegistry, SessionStore, TicketAuthenticator};

mod listener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SpicegateConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SpicegateConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SpicegateConfig::default()
    });
    tracing::info!(
        listen_addr = %config.network.listen_addr,
        step_timeout_secs = config.handshake.step_timeout_secs,
        "spicegated starting"
    );

    // Authenticators
    let registry = {
        let mut r = AuthRegistry::new();
        if config.auth.spice {
            let ticket = TicketAuthenticator::new(config.auth.tickets.clone());
            tracing::info!(tickets = ticket.ticket_count(), "spice ticket auth enabled");
            r.register(Arc::new(ticket));
        }
        if r.is_empty() {
            tracing::warn!("no authentication methods registered, every tenant will be refused");
        }
        Arc::new(r)
    };
    let auth_methods: Vec<String> = registry.methods().iter().map(|m| m.to_string()).collect();

    // Shared state
    let sessions = new_session_table();
    let proxy = Arc::new(
        Proxy::new(registry, sessions.clone() as Arc<dyn SessionStore>)
            .with_step_timeout(config.handshake.step_timeout()),
    );

    let tcp = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    tracing::info!(addr = %tcp.local_addr()?, "accepting tenants");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener_task = tokio::spawn(
        listener::TenantListener::new(tcp, proxy.clone(), shutdown_tx.subscribe()).run(),
    );

    let session_printer = {
        let sessions = sessions.clone();
        let stats = proxy.stats();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let s = stats.snapshot();
                tracing::debug!(
                    sessions = sessions.len(),
                    active = s.active,
                    established = s.established,
                    failed = s.failed,
                    "relay snapshot"
                );
            }
        })
    };

    // Status HTTP endpoint
    let api_port = config.network.api_port;
    if api_port != 0 {
        let state = spicegate_api::ApiState {
            sessions: sessions.clone(),
            stats: proxy.stats(),
            listen_addr: config.network.listen_addr.clone(),
            auth_methods,
        };
        tokio::spawn(async move {
            if let Err(e) = spicegate_api::serve(state, api_port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = listener_task        => tracing::error!("tenant listener exited: {:?}", r),
        r = session_printer      => tracing::error!("session printer exited: {:?}", r),
    }

    Ok(())
}
