//! Compute-facing handshake: the relay plays client to the compute host.

use tokio::net::TcpStream;
use zerocopy::FromBytes;

use spicegate_core::crypto::TicketPublicKey;
use spicegate_core::wire::{
    data_header_size, decode_data_header, has_cap, main_init_session_id, with_cap, AuthMethod,
    ChannelType, ClientLinkMessage, ErrorCode, LinkHeader, ServerLinkMessage, ServerTicket,
    WireError, COMMON_CAP_AUTH_SELECTION, COMMON_CAP_AUTH_SPICE, COMMON_CAP_MINI_HEADER,
    MSG_MAIN_INIT, SERVER_TICKET_SIZE,
};
use spicegate_services::framer::{read_exact_accumulating, read_message, write_message, write_raw};
use spicegate_services::SessionError;

use crate::error::HandshakeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeState {
    Connect,
    SendLinkMessage,
    AwaitLinkReply,
    SendAuthMethod,
    SendTicket,
    AwaitTicketResult,
    AwaitMainInit,
    Done,
    Failed,
}

/// Everything the compute side needs from the tenant side.
#[derive(Debug, Clone)]
pub struct ComputeTarget {
    pub channel_type: ChannelType,
    pub channel_id: u8,
    pub session_id: u32,
    pub destination: String,
    pub otp: String,
    pub tenant_common_caps: Vec<u32>,
    pub tenant_channel_caps: Vec<u32>,
}

/// A compute connection that has finished its handshake.
#[derive(Debug)]
pub struct ComputeLink {
    pub stream: TcpStream,
    /// Session the compute host placed this channel in.
    pub session_id: u32,
    /// Bytes already read from the compute host that the tenant still has
    /// to receive (the main channel's init message).
    pub forward: Vec<u8>,
}

pub struct ComputeHandshake {
    target: ComputeTarget,
    state: ComputeState,
    stream: Option<TcpStream>,
    server_key: Option<TicketPublicKey>,
    server_common_caps: Vec<u32>,
    session_id: u32,
    forward: Vec<u8>,
}

impl ComputeHandshake {
    pub fn new(target: ComputeTarget) -> Self {
        let session_id = target.session_id;
        Self {
            target,
            state: ComputeState::Connect,
            stream: None,
            server_key: None,
            server_common_caps: Vec::new(),
            session_id,
            forward: Vec::new(),
        }
    }

    pub fn state(&self) -> ComputeState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ComputeState::Done
    }

    /// Session id as currently known: the supplied one until the compute
    /// host announces its own.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Advance by one unit of work: a connect, one write or one read.
    pub async fn step(&mut self) -> Result<(), HandshakeError> {
        let next = match self.state {
            ComputeState::Done => return Ok(()),
            ComputeState::Failed => return Err(HandshakeError::Terminated),
            ComputeState::Connect => self.connect().await,
            ComputeState::SendLinkMessage => self.send_link_message().await,
            ComputeState::AwaitLinkReply => self.await_link_reply().await,
            ComputeState::SendAuthMethod => self.send_auth_method().await,
            ComputeState::SendTicket => self.send_ticket().await,
            ComputeState::AwaitTicketResult => self.await_ticket_result().await,
            ComputeState::AwaitMainInit => self.await_main_init().await,
        };
        match next {
            Ok(state) => {
                tracing::trace!(from = ?self.state, to = ?state, "compute handshake step");
                self.state = state;
                Ok(())
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Give up and close the compute connection.
    pub fn abort(&mut self) {
        self.state = ComputeState::Failed;
        self.stream = None;
    }

    /// Hand over the finished link. `None` unless the handshake is done.
    pub fn into_link(self) -> Option<ComputeLink> {
        if self.state != ComputeState::Done {
            return None;
        }
        Some(ComputeLink {
            stream: self.stream?,
            session_id: self.session_id,
            forward: self.forward,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, HandshakeError> {
        self.stream.as_mut().ok_or(HandshakeError::Terminated)
    }

    async fn connect(&mut self) -> Result<ComputeState, HandshakeError> {
        if self.target.destination.is_empty() {
            return Err(HandshakeError::SessionResolution {
                session_id: self.target.session_id,
                source: SessionError::NoDestination,
            });
        }
        let stream = TcpStream::connect(self.target.destination.as_str()).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(destination = %self.target.destination, "connected to compute host");
        self.stream = Some(stream);
        Ok(ComputeState::SendLinkMessage)
    }

    async fn send_link_message(&mut self) -> Result<ComputeState, HandshakeError> {
        let common_caps = with_cap(
            with_cap(self.target.tenant_common_caps.clone(), COMMON_CAP_AUTH_SELECTION),
            COMMON_CAP_AUTH_SPICE,
        );
        let body = ClientLinkMessage {
            session_id: self.target.session_id,
            channel_type: self.target.channel_type,
            channel_id: self.target.channel_id,
            common_caps,
            channel_caps: self.target.tenant_channel_caps.clone(),
        }
        .encode();
        let header = LinkHeader::new(body.len() as u32);
        write_message(self.stream()?, &header, &body).await?;
        Ok(ComputeState::AwaitLinkReply)
    }

    async fn await_link_reply(&mut self) -> Result<ComputeState, HandshakeError> {
        let (_, body) = read_message(self.stream()?).await?;
        let reply = ServerLinkMessage::decode(&body)?;
        if reply.error != ErrorCode::Ok {
            return Err(HandshakeError::ComputeRefused {
                stage: "link",
                code: reply.error,
            });
        }
        self.server_key = Some(TicketPublicKey::from_slot(&reply.pub_key)?);
        self.server_common_caps = reply.common_caps;
        if self.mini_header_mismatch() {
            tracing::warn!(
                destination = %self.target.destination,
                "tenant negotiated mini headers but compute host uses full headers"
            );
        }

        if has_cap(&self.server_common_caps, COMMON_CAP_AUTH_SELECTION) {
            Ok(ComputeState::SendAuthMethod)
        } else {
            Ok(ComputeState::SendTicket)
        }
    }

    async fn send_auth_method(&mut self) -> Result<ComputeState, HandshakeError> {
        write_raw(self.stream()?, &AuthMethod::SPICE.to_selection()).await?;
        Ok(ComputeState::SendTicket)
    }

    async fn send_ticket(&mut self) -> Result<ComputeState, HandshakeError> {
        let key = self.server_key.as_ref().ok_or(HandshakeError::Terminated)?;
        let ticket = key.encrypt_ticket(&self.target.otp)?;
        write_raw(self.stream()?, &ticket).await?;
        Ok(ComputeState::AwaitTicketResult)
    }

    async fn await_ticket_result(&mut self) -> Result<ComputeState, HandshakeError> {
        let raw = read_exact_accumulating(self.stream()?, SERVER_TICKET_SIZE).await?;
        let code = ServerTicket::read_from(raw.as_slice())
            .ok_or(WireError::Truncated {
                what: "server ticket",
                need: SERVER_TICKET_SIZE,
                got: raw.len(),
            })?
            .result()?;
        if code != ErrorCode::Ok {
            return Err(HandshakeError::ComputeRefused {
                stage: "ticket",
                code,
            });
        }
        if self.target.channel_type == ChannelType::Main {
            Ok(ComputeState::AwaitMainInit)
        } else {
            Ok(ComputeState::Done)
        }
    }

    /// Whether the tenant asked for mini data headers that the compute host
    /// did not grant. Spliced traffic then carries full headers.
    pub fn mini_header_mismatch(&self) -> bool {
        has_cap(&self.target.tenant_common_caps, COMMON_CAP_MINI_HEADER)
            && !self.server_common_caps.is_empty()
            && !has_cap(&self.server_common_caps, COMMON_CAP_MINI_HEADER)
    }

    async fn await_main_init(&mut self) -> Result<ComputeState, HandshakeError> {
        let mini = has_cap(&self.target.tenant_common_caps, COMMON_CAP_MINI_HEADER)
            && has_cap(&self.server_common_caps, COMMON_CAP_MINI_HEADER);
        let stream = self.stream()?;
        let mut raw = read_exact_accumulating(&mut *stream, data_header_size(mini)).await?;
        let info = decode_data_header(&raw, mini)?;
        if info.msg_type != MSG_MAIN_INIT {
            return Err(WireError::UnexpectedMessage {
                expected: MSG_MAIN_INIT,
                got: info.msg_type,
            }
            .into());
        }
        let body = read_exact_accumulating(stream, info.size as usize).await?;
        let session_id = main_init_session_id(&body)?;
        if session_id != self.session_id {
            tracing::debug!(
                supplied = self.session_id,
                assigned = session_id,
                "compute host assigned session"
            );
        }
        self.session_id = session_id;
        raw.extend_from_slice(&body);
        self.forward = raw;
        Ok(ComputeState::Done)
    }
}

impl std::fmt::Debug for ComputeHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeHandshake")
            .field("state", &self.state)
            .field("destination", &self.target.destination)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCompute, FakeComputeConfig};
    use spicegate_core::wire::RELAY_COMMON_CAPS;

    fn target(destination: String, channel_type: ChannelType) -> ComputeTarget {
        ComputeTarget {
            channel_type,
            channel_id: 0,
            session_id: 0,
            destination,
            otp: "pw".into(),
            tenant_common_caps: vec![RELAY_COMMON_CAPS],
            tenant_channel_caps: vec![],
        }
    }

    async fn run_to_end(hs: &mut ComputeHandshake) -> Result<(), HandshakeError> {
        while !hs.is_done() {
            hs.step().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn main_channel_learns_assigned_session() {
        let fake = FakeCompute::start(FakeComputeConfig {
            assign_session_id: 0x77,
            ..Default::default()
        })
        .await
        .unwrap();

        let mut hs = ComputeHandshake::new(target(fake.addr().to_string(), ChannelType::Main));
        run_to_end(&mut hs).await.unwrap();
        assert_eq!(hs.session_id(), 0x77);

        let link = hs.into_link().unwrap();
        assert_eq!(link.session_id, 0x77);
        // Mini header (both sides advertise it) plus the init body.
        assert_eq!(&link.forward[..2], &MSG_MAIN_INIT.to_le_bytes());
        assert_eq!(link.forward.len(), 6 + 32);

        let seen = fake.seen().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].password, "pw");
        assert_eq!(seen[0].method, Some(AuthMethod::SPICE));
        assert!(has_cap(&seen[0].link.common_caps, COMMON_CAP_AUTH_SPICE));
    }

    #[tokio::test]
    async fn full_header_when_compute_lacks_mini() {
        let fake = FakeCompute::start(FakeComputeConfig {
            assign_session_id: 5,
            mini_header: false,
            ..Default::default()
        })
        .await
        .unwrap();

        let mut hs = ComputeHandshake::new(target(fake.addr().to_string(), ChannelType::Main));
        assert!(!hs.mini_header_mismatch());
        run_to_end(&mut hs).await.unwrap();
        assert!(hs.mini_header_mismatch());
        let link = hs.into_link().unwrap();
        assert_eq!(link.session_id, 5);
        assert_eq!(link.forward.len(), 18 + 32);
    }

    #[tokio::test]
    async fn secondary_channel_skips_main_init() {
        let fake = FakeCompute::start(FakeComputeConfig::default()).await.unwrap();

        let mut t = target(fake.addr().to_string(), ChannelType::Display);
        t.session_id = 1234;
        let mut hs = ComputeHandshake::new(t);
        run_to_end(&mut hs).await.unwrap();

        let link = hs.into_link().unwrap();
        assert_eq!(link.session_id, 1234);
        assert!(link.forward.is_empty());
        assert_eq!(fake.seen().await[0].link.session_id, 1234);
    }

    #[tokio::test]
    async fn skips_auth_selection_when_not_advertised() {
        let fake = FakeCompute::start(FakeComputeConfig {
            auth_selection: false,
            ..Default::default()
        })
        .await
        .unwrap();

        let mut hs = ComputeHandshake::new(target(fake.addr().to_string(), ChannelType::Display));
        hs.step().await.unwrap(); // connect
        hs.step().await.unwrap(); // link message
        hs.step().await.unwrap(); // link reply
        assert_eq!(hs.state(), ComputeState::SendTicket);
        run_to_end(&mut hs).await.unwrap();
        assert_eq!(fake.seen().await[0].method, None);
    }

    #[tokio::test]
    async fn link_refusal_is_reported() {
        let fake = FakeCompute::start(FakeComputeConfig {
            link_error: ErrorCode::ChannelNotAvailable,
            ..Default::default()
        })
        .await
        .unwrap();

        let mut hs = ComputeHandshake::new(target(fake.addr().to_string(), ChannelType::Main));
        let err = run_to_end(&mut hs).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::ComputeRefused {
                stage: "link",
                code: ErrorCode::ChannelNotAvailable
            }
        ));
        assert_eq!(hs.state(), ComputeState::Failed);
        assert!(matches!(hs.step().await, Err(HandshakeError::Terminated)));
    }

    #[tokio::test]
    async fn wrong_password_is_refused_at_ticket() {
        let fake = FakeCompute::start(FakeComputeConfig {
            password: Some("other".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut hs = ComputeHandshake::new(target(fake.addr().to_string(), ChannelType::Main));
        let err = run_to_end(&mut hs).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::ComputeRefused {
                stage: "ticket",
                code: ErrorCode::PermissionDenied
            }
        ));
        assert!(hs.into_link().is_none());
    }

    #[tokio::test]
    async fn empty_destination_is_a_resolution_error() {
        let mut hs = ComputeHandshake::new(target(String::new(), ChannelType::Main));
        assert!(matches!(
            hs.step().await,
            Err(HandshakeError::SessionResolution {
                source: SessionError::NoDestination,
                ..
            })
        ));
    }
}
