//! Tenant-facing handshake: the relay plays server to the tenant.

use std::sync::Arc;

use zerocopy::AsBytes;

use spicegate_core::crypto::EphemeralKeypair;
use spicegate_core::wire::{
    AuthMethod, ClientLinkMessage, ErrorCode, ServerLinkMessage, ServerTicket, NEW_SESSION_ID,
    RELAY_CHANNEL_CAPS, RELAY_COMMON_CAPS,
};
use spicegate_services::framer::{read_exact_accumulating, read_message, write_message, write_raw};
use spicegate_services::{AuthContext, AuthRegistry, Authenticator, SessionStore, TenantStream};

use super::compute::{ComputeHandshake, ComputeLink, ComputeTarget};
use crate::error::HandshakeError;

/// Tenant handshake states. They only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    AwaitLinkMessage,
    SendLinkReply,
    ResolveOtp,
    AwaitAuthMethod,
    RunAuthentication,
    ResolveDestination,
    DelegateToCompute,
    Finalize,
    Done,
    Failed,
}

pub struct TenantHandshake<'t> {
    tenant: &'t mut dyn TenantStream,
    registry: Arc<AuthRegistry>,
    sessions: Arc<dyn SessionStore>,
    state: TenantState,

    link: Option<ClientLinkMessage>,
    session_id: u32,
    keypair: Option<EphemeralKeypair>,
    auth_method: Option<AuthMethod>,
    strategy: Option<Arc<dyn Authenticator>>,
    otp: String,
    destination: String,

    compute: Option<ComputeHandshake>,
    compute_link: Option<ComputeLink>,
    completed: bool,
}

impl<'t> TenantHandshake<'t> {
    pub fn new(
        tenant: &'t mut dyn TenantStream,
        registry: Arc<AuthRegistry>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            tenant,
            registry,
            sessions,
            state: TenantState::AwaitLinkMessage,
            link: None,
            session_id: NEW_SESSION_ID,
            keypair: None,
            auth_method: None,
            strategy: None,
            otp: String::new(),
            destination: String::new(),
            compute: None,
            compute_link: None,
            completed: false,
        }
    }

    pub fn state(&self) -> TenantState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.completed
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn auth_method(&self) -> Option<AuthMethod> {
        self.auth_method
    }

    /// The compute connection, once the handshake is done.
    pub fn take_link(&mut self) -> Option<ComputeLink> {
        self.compute_link.take()
    }

    /// Perform one state's work.
    ///
    /// After completion this is a no-op. After a failure it returns
    /// [`HandshakeError::Terminated`].
    pub async fn step(&mut self) -> Result<(), HandshakeError> {
        let next = match self.state {
            TenantState::Done => return Ok(()),
            TenantState::Failed => return Err(HandshakeError::Terminated),
            TenantState::AwaitLinkMessage => self.await_link_message().await,
            TenantState::SendLinkReply => self.send_link_reply().await,
            TenantState::ResolveOtp => Ok(self.resolve_otp()),
            TenantState::AwaitAuthMethod => self.await_auth_method().await,
            TenantState::RunAuthentication => self.run_authentication().await,
            TenantState::ResolveDestination => self.resolve_destination(),
            TenantState::DelegateToCompute => self.delegate_to_compute().await,
            TenantState::Finalize => self.finalize(),
        };
        match next {
            Ok(state) => {
                tracing::trace!(from = ?self.state, to = ?state, "tenant handshake step");
                self.state = state;
                Ok(())
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Fail the handshake: drop the key and any compute connection.
    /// Nothing is registered.
    pub fn abort(&mut self) {
        self.state = TenantState::Failed;
        self.keypair = None;
        self.strategy = None;
        if let Some(mut compute) = self.compute.take() {
            compute.abort();
        }
    }

    async fn await_link_message(&mut self) -> Result<TenantState, HandshakeError> {
        let (header, body) = read_message(&mut *self.tenant).await?;
        let link = ClientLinkMessage::decode(&body)?;
        tracing::debug!(
            session_id = link.session_id,
            channel = ?link.channel_type,
            channel_id = link.channel_id,
            minor_version = header.minor_version(),
            "tenant link message"
        );
        self.session_id = link.session_id;
        self.link = Some(link);
        Ok(TenantState::SendLinkReply)
    }

    async fn send_link_reply(&mut self) -> Result<TenantState, HandshakeError> {
        let keypair = tokio::task::spawn_blocking(EphemeralKeypair::generate)
            .await
            .map_err(std::io::Error::other)??;
        let public_slot = keypair.public_slot();
        self.keypair = Some(keypair);

        let reply = ServerLinkMessage {
            error: ErrorCode::Ok,
            pub_key: public_slot,
            common_caps: vec![RELAY_COMMON_CAPS],
            channel_caps: vec![RELAY_CHANNEL_CAPS],
        };
        write_message(&mut *self.tenant, &reply.header(), &reply.encode()).await?;
        tracing::debug!(pub_key = %hex::encode(&public_slot[..8]), "sent link reply");
        Ok(TenantState::ResolveOtp)
    }

    fn resolve_otp(&mut self) -> TenantState {
        if self.session_id != NEW_SESSION_ID {
            self.otp = self.sessions.otp(self.session_id);
        }
        TenantState::AwaitAuthMethod
    }

    async fn await_auth_method(&mut self) -> Result<TenantState, HandshakeError> {
        let raw = read_exact_accumulating(&mut *self.tenant, 4).await?;
        let method = AuthMethod::from_selection([raw[0], raw[1], raw[2], raw[3]]);
        self.auth_method = Some(method);

        match self.registry.lookup(method) {
            Some(strategy) => {
                tracing::debug!(%method, "tenant selected auth method");
                self.strategy = Some(strategy);
                Ok(TenantState::RunAuthentication)
            }
            None => {
                self.deny().await;
                Err(HandshakeError::AuthUnavailable(method))
            }
        }
    }

    async fn run_authentication(&mut self) -> Result<TenantState, HandshakeError> {
        let strategy = self.strategy.take().ok_or(HandshakeError::Terminated)?;
        let keypair = self.keypair.as_ref().ok_or(HandshakeError::Terminated)?;

        let mut ctx = AuthContext {
            tenant: &mut *self.tenant,
            keypair,
            otp: std::mem::take(&mut self.otp),
            destination: std::mem::take(&mut self.destination),
        };
        let result = strategy.next(&mut ctx).await;
        let AuthContext { otp, .. } = ctx;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.deny().await;
                return Err(HandshakeError::Authenticator(e));
            }
        };
        if !outcome.accepted {
            self.deny().await;
            return Err(HandshakeError::AuthRejected);
        }

        self.otp = otp;
        self.destination = outcome.destination;
        write_raw(&mut *self.tenant, ServerTicket::new(ErrorCode::Ok).as_bytes()).await?;
        tracing::debug!(session_id = self.session_id, "tenant authenticated");
        Ok(TenantState::ResolveDestination)
    }

    fn resolve_destination(&mut self) -> Result<TenantState, HandshakeError> {
        let session_id = self.session_id;
        if session_id != NEW_SESSION_ID && self.sessions.lookup(session_id) {
            self.destination = self
                .sessions
                .connect(session_id)
                .map_err(|source| HandshakeError::SessionResolution { session_id, source })?;
        }
        Ok(TenantState::DelegateToCompute)
    }

    async fn delegate_to_compute(&mut self) -> Result<TenantState, HandshakeError> {
        if self.compute.is_none() {
            let link = self.link.as_ref().ok_or(HandshakeError::Terminated)?;
            self.compute = Some(ComputeHandshake::new(ComputeTarget {
                channel_type: link.channel_type,
                channel_id: link.channel_id,
                session_id: self.session_id,
                destination: self.destination.clone(),
                otp: self.otp.clone(),
                tenant_common_caps: link.common_caps.clone(),
                tenant_channel_caps: link.channel_caps.clone(),
            }));
            tracing::debug!(destination = %self.destination, "starting compute handshake");
            return Ok(TenantState::DelegateToCompute);
        }

        let compute = self.compute.as_mut().ok_or(HandshakeError::Terminated)?;
        compute.step().await?;
        if compute.is_done() {
            Ok(TenantState::Finalize)
        } else {
            Ok(TenantState::DelegateToCompute)
        }
    }

    fn finalize(&mut self) -> Result<TenantState, HandshakeError> {
        let link = self
            .compute
            .take()
            .and_then(ComputeHandshake::into_link)
            .ok_or(HandshakeError::Terminated)?;

        self.session_id = link.session_id;
        // A secondary channel opened without a session id never learns one.
        if self.session_id == NEW_SESSION_ID {
            tracing::debug!(destination = %self.destination, "no session id assigned, not registering");
        } else {
            self.sessions.add(self.session_id, &self.destination, &self.otp);
        }
        self.keypair = None;
        self.completed = true;
        self.compute_link = Some(link);

        tracing::info!(
            session_id = self.session_id,
            destination = %self.destination,
            "handshake complete"
        );
        Ok(TenantState::Done)
    }

    /// Best-effort `PermissionDenied` ticket. A failed write is only logged.
    async fn deny(&mut self) {
        let ticket = ServerTicket::new(ErrorCode::PermissionDenied);
        if let Err(e) = write_raw(&mut *self.tenant, ticket.as_bytes()).await {
            tracing::warn!(error = %e, "failed to send denial ticket");
        }
    }
}

impl std::fmt::Debug for TenantHandshake<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandshake")
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("auth_method", &self.auth_method)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}
