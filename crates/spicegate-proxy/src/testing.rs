//! Test peers: a scripted compute host, tenant-side helpers and simple
//! collaborators. Compiled for this crate's tests and behind the `testing`
//! feature for everyone else's.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use zerocopy::{AsBytes, FromBytes};

use spicegate_core::crypto::{EphemeralKeypair, TicketPublicKey};
use spicegate_core::wire::{
    has_cap, AuthMethod, ChannelType, ClientLinkMessage, DataHeader, ErrorCode, LinkHeader,
    MiniDataHeader, ServerLinkMessage, ServerTicket, COMMON_CAP_AUTH_SELECTION,
    COMMON_CAP_AUTH_SPICE, COMMON_CAP_MINI_HEADER, MSG_MAIN_INIT, SERVER_TICKET_SIZE,
    TICKET_PUBKEY_BYTES,
};
use spicegate_services::framer::{read_exact_accumulating, read_message, write_message, write_raw};
use spicegate_services::{
    AuthContext, AuthOutcome, Authenticator, SessionError, SessionStore, SessionTable,
};

// ── Fake compute host ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FakeComputeConfig {
    /// Session id announced in MAIN_INIT when the client asked for a new one.
    pub assign_session_id: u32,
    /// Required ticket password. `None` accepts anything.
    pub password: Option<String>,
    pub auth_selection: bool,
    pub mini_header: bool,
    /// Error code put in the link reply.
    pub link_error: ErrorCode,
}

impl Default for FakeComputeConfig {
    fn default() -> Self {
        Self {
            assign_session_id: 0x1000,
            password: None,
            auth_selection: true,
            mini_header: true,
            link_error: ErrorCode::Ok,
        }
    }
}

/// What the fake compute host saw from one client.
#[derive(Debug, Clone)]
pub struct SeenLink {
    pub link: ClientLinkMessage,
    pub method: Option<AuthMethod>,
    pub password: String,
}

/// A SPICE server that completes the link handshake per its config and then
/// echoes every byte back.
pub struct FakeCompute {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenLink>>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeCompute {
    pub async fn start(config: FakeComputeConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let seen = seen.clone();
            let accepted = accepted.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let config = config.clone();
                    let seen = seen.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_compute(stream, config, seen).await {
                            tracing::debug!(error = %e, "fake compute connection ended");
                        }
                    });
                }
            }
        });

        Ok(Self {
            addr,
            seen,
            accepted,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Clients that got as far as presenting a ticket.
    pub async fn seen(&self) -> Vec<SeenLink> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Drop for FakeCompute {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_compute(
    mut stream: TcpStream,
    config: FakeComputeConfig,
    seen: Arc<Mutex<Vec<SeenLink>>>,
) -> anyhow::Result<()> {
    let (_, body) = read_message(&mut stream).await?;
    let link = ClientLinkMessage::decode(&body)?;

    let mut common = 1u32 << COMMON_CAP_AUTH_SPICE;
    if config.auth_selection {
        common |= 1 << COMMON_CAP_AUTH_SELECTION;
    }
    if config.mini_header {
        common |= 1 << COMMON_CAP_MINI_HEADER;
    }

    if config.link_error != ErrorCode::Ok {
        let reply = ServerLinkMessage {
            error: config.link_error,
            pub_key: [0u8; TICKET_PUBKEY_BYTES],
            common_caps: vec![common],
            channel_caps: vec![],
        };
        write_message(&mut stream, &reply.header(), &reply.encode()).await?;
        return Ok(());
    }

    let keypair = EphemeralKeypair::generate()?;
    let reply = ServerLinkMessage {
        error: ErrorCode::Ok,
        pub_key: keypair.public_slot(),
        common_caps: vec![common],
        channel_caps: vec![],
    };
    write_message(&mut stream, &reply.header(), &reply.encode()).await?;

    let method = if config.auth_selection {
        let raw = read_exact_accumulating(&mut stream, 4).await?;
        Some(AuthMethod::from_selection([raw[0], raw[1], raw[2], raw[3]]))
    } else {
        None
    };

    let ciphertext = read_exact_accumulating(&mut stream, keypair.ticket_len()).await?;
    let password = keypair.decrypt_ticket(&ciphertext)?.to_string();
    let accepted = config.password.as_ref().map_or(true, |p| *p == password);

    if let Ok(mut s) = seen.lock() {
        s.push(SeenLink {
            link: link.clone(),
            method,
            password,
        });
    }

    let result = if accepted {
        ErrorCode::Ok
    } else {
        ErrorCode::PermissionDenied
    };
    write_raw(&mut stream, ServerTicket::new(result).as_bytes()).await?;
    if !accepted {
        return Ok(());
    }

    if link.channel_type == ChannelType::Main {
        let session_id = if link.session_id == 0 {
            config.assign_session_id
        } else {
            link.session_id
        };
        let mut init = session_id.to_le_bytes().to_vec();
        init.resize(32, 0);

        let mut msg = if has_cap(&link.common_caps, COMMON_CAP_MINI_HEADER) && config.mini_header {
            MiniDataHeader::new(MSG_MAIN_INIT, init.len() as u32).as_bytes().to_vec()
        } else {
            DataHeader::new(1, MSG_MAIN_INIT, init.len() as u32).as_bytes().to_vec()
        };
        msg.extend_from_slice(&init);
        write_raw(&mut stream, &msg).await?;
    }

    let (mut r, mut w) = stream.split();
    tokio::io::copy(&mut r, &mut w).await?;
    Ok(())
}

// ── Tenant-side helpers ───────────────────────────────────────────────────────

/// Send a client link message and read the relay's reply.
pub async fn send_link<S>(
    stream: &mut S,
    session_id: u32,
    channel_type: ChannelType,
    common_caps: Vec<u32>,
) -> anyhow::Result<ServerLinkMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = ClientLinkMessage {
        session_id,
        channel_type,
        channel_id: 0,
        common_caps,
        channel_caps: vec![],
    }
    .encode();
    write_message(stream, &LinkHeader::new(body.len() as u32), &body).await?;
    let (header, body) = read_message(stream).await?;
    anyhow::ensure!(header.size() as usize == body.len(), "reply size mismatch");
    Ok(ServerLinkMessage::decode(&body)?)
}

pub async fn select_method<S>(stream: &mut S, method: AuthMethod) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_raw(stream, &method.to_selection()).await?;
    Ok(())
}

/// Encrypt `password` under the key in `reply` and send it.
pub async fn send_ticket<S>(stream: &mut S, reply: &ServerLinkMessage, password: &str) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let ticket = TicketPublicKey::from_slot(&reply.pub_key)?.encrypt_ticket(password)?;
    write_raw(stream, &ticket).await?;
    Ok(())
}

pub async fn read_ticket<S>(stream: &mut S) -> anyhow::Result<ErrorCode>
where
    S: AsyncRead + Unpin,
{
    let raw = read_exact_accumulating(stream, SERVER_TICKET_SIZE).await?;
    let ticket = ServerTicket::read_from(raw.as_slice())
        .ok_or_else(|| anyhow::anyhow!("short ticket"))?;
    Ok(ticket.result()?)
}

// ── Collaborators ─────────────────────────────────────────────────────────────

/// SPICE-method strategy with a fixed answer that reads nothing from the
/// tenant. An accepting one fills in an otp for new sessions.
pub struct FixedAuthenticator {
    outcome: AuthOutcome,
}

impl FixedAuthenticator {
    pub fn accept(destination: impl Into<String>) -> Self {
        Self {
            outcome: AuthOutcome::accept(destination),
        }
    }

    pub fn reject() -> Self {
        Self {
            outcome: AuthOutcome::reject(),
        }
    }
}

impl Authenticator for FixedAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::SPICE
    }

    fn next<'a>(&'a self, ctx: &'a mut AuthContext<'_>) -> BoxFuture<'a, anyhow::Result<AuthOutcome>> {
        async move {
            if self.outcome.accepted && ctx.otp.is_empty() {
                ctx.otp = "fixed-otp".to_string();
            }
            Ok(self.outcome.clone())
        }
        .boxed()
    }
}

/// Session store that remembers every `add`.
#[derive(Default)]
pub struct RecordingStore {
    table: SessionTable,
    adds: Mutex<Vec<(u32, String, String)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session without recording it as an add.
    pub fn preload(&self, session_id: u32, destination: &str, otp: &str) {
        self.table.add(session_id, destination, otp);
    }

    pub fn adds(&self) -> Vec<(u32, String, String)> {
        self.adds.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl SessionStore for RecordingStore {
    fn otp(&self, session_id: u32) -> String {
        self.table.otp(session_id)
    }

    fn lookup(&self, session_id: u32) -> bool {
        self.table.lookup(session_id)
    }

    fn connect(&self, session_id: u32) -> Result<String, SessionError> {
        self.table.connect(session_id)
    }

    fn add(&self, session_id: u32, destination: &str, otp: &str) {
        if let Ok(mut adds) = self.adds.lock() {
            adds.push((session_id, destination.to_string(), otp.to_string()));
        }
        self.table.add(session_id, destination, otp);
    }
}
