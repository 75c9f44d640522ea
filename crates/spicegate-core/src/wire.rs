//! SPICE link wire format: on-wire types for the relay's handshake.
//!
//! These types ARE the protocol as both peers see it. Every field, every size
//! and every reserved byte must match what a stock SPICE client and server
//! expect. All integers are little-endian.
//!
//! Fixed-size parts are `#[repr(C)]` structs of byte-order-aware integers with
//! zerocopy derives, so layout is deterministic and unaligned reads are safe.
//! Variable-length parts (capability vectors) are encoded by hand around them.
//! There is no unsafe code in this module.

use std::fmt;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

type LeU16 = U16<LittleEndian>;
type LeU32 = U32<LittleEndian>;
type LeU64 = U64<LittleEndian>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// "REDQ" read as a little-endian u32.
pub const LINK_MAGIC: u32 = 0x5144_4552;

pub const VERSION_MAJOR: u32 = 2;
pub const VERSION_MINOR: u32 = 2;

/// Size of the public-key slot in a server link reply.
/// Exactly the SubjectPublicKeyInfo DER of a 1024-bit RSA key.
pub const TICKET_PUBKEY_BYTES: usize = 162;

/// Largest link body either side will accept. Link messages are a few dozen
/// bytes; anything this large is a broken or hostile peer.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024;

/// Session identifier meaning "new session, not yet assigned".
pub const NEW_SESSION_ID: u32 = 0;

/// First message the compute host sends on the main channel.
pub const MSG_MAIN_INIT: u16 = 103;

/// Common capability bits.
pub const COMMON_CAP_AUTH_SELECTION: u32 = 0;
pub const COMMON_CAP_AUTH_SPICE: u32 = 1;
pub const COMMON_CAP_AUTH_SASL: u32 = 2;
pub const COMMON_CAP_MINI_HEADER: u32 = 3;

/// Common capability word the relay advertises to tenants:
/// auth selection, SPICE ticket auth and mini headers.
pub const RELAY_COMMON_CAPS: u32 = 0x0b;

/// Channel capability word the relay advertises to tenants.
pub const RELAY_CHANNEL_CAPS: u32 = 0x09;

/// Test whether capability `bit` is set in a vector of capability words.
pub fn has_cap(words: &[u32], bit: u32) -> bool {
    let word = (bit / 32) as usize;
    words
        .get(word)
        .map(|w| w & (1 << (bit % 32)) != 0)
        .unwrap_or(false)
}

/// Return `words` with capability `bit` set, growing the vector if needed.
pub fn with_cap(mut words: Vec<u32>, bit: u32) -> Vec<u32> {
    let word = (bit / 32) as usize;
    if words.len() <= word {
        words.resize(word + 1, 0);
    }
    words[word] |= 1 << (bit % 32);
    words
}

// ── Link Header ───────────────────────────────────────────────────────────────

/// Prefix of every link-stage message in either direction.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct LinkHeader {
    magic: LeU32,
    major_version: LeU32,
    minor_version: LeU32,
    /// Byte length of the body that follows.
    size: LeU32,
}

assert_eq_size!(LinkHeader, [u8; 16]);

pub const LINK_HEADER_SIZE: usize = std::mem::size_of::<LinkHeader>();

impl LinkHeader {
    /// Header for a body of `size` bytes at the current protocol version.
    pub fn new(size: u32) -> Self {
        Self {
            magic: LeU32::new(LINK_MAGIC),
            major_version: LeU32::new(VERSION_MAJOR),
            minor_version: LeU32::new(VERSION_MINOR),
            size: LeU32::new(size),
        }
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn minor_version(&self) -> u32 {
        self.minor_version.get()
    }

    /// Parse and validate a header. Rejects a bad magic, a foreign major
    /// version and bodies larger than [`MAX_MESSAGE_SIZE`].
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from(bytes).ok_or(WireError::Truncated {
            what: "link header",
            need: LINK_HEADER_SIZE,
            got: bytes.len(),
        })?;
        if header.magic.get() != LINK_MAGIC {
            return Err(WireError::BadMagic(header.magic.get()));
        }
        if header.major_version.get() != VERSION_MAJOR {
            return Err(WireError::VersionMismatch(header.major_version.get()));
        }
        if header.size.get() > MAX_MESSAGE_SIZE {
            return Err(WireError::TooLarge(header.size.get()));
        }
        Ok(header)
    }
}

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Kind of SPICE channel a link message opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelType {
    Main = 1,
    Display = 2,
    Inputs = 3,
    Cursor = 4,
    Playback = 5,
    Record = 6,
    Tunnel = 7,
    Smartcard = 8,
    Usbredir = 9,
    Port = 10,
    Webdav = 11,
}

impl TryFrom<u8> for ChannelType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ChannelType::Main,
            2 => ChannelType::Display,
            3 => ChannelType::Inputs,
            4 => ChannelType::Cursor,
            5 => ChannelType::Playback,
            6 => ChannelType::Record,
            7 => ChannelType::Tunnel,
            8 => ChannelType::Smartcard,
            9 => ChannelType::Usbredir,
            10 => ChannelType::Port,
            11 => ChannelType::Webdav,
            other => return Err(WireError::UnknownChannelType(other)),
        })
    }
}

impl From<ChannelType> for u8 {
    fn from(c: ChannelType) -> u8 {
        c as u8
    }
}

/// Link result codes, carried by the server link reply and by tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    /// Unspecified failure.
    Generic = 1,
    InvalidMagic = 2,
    InvalidData = 3,
    VersionMismatch = 4,
    NeedSecured = 5,
    NeedUnsecured = 6,
    PermissionDenied = 7,
    BadConnectionId = 8,
    ChannelNotAvailable = 9,
}

impl TryFrom<u32> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Generic,
            2 => ErrorCode::InvalidMagic,
            3 => ErrorCode::InvalidData,
            4 => ErrorCode::VersionMismatch,
            5 => ErrorCode::NeedSecured,
            6 => ErrorCode::NeedUnsecured,
            7 => ErrorCode::PermissionDenied,
            8 => ErrorCode::BadConnectionId,
            9 => ErrorCode::ChannelNotAvailable,
            other => return Err(WireError::UnknownErrorCode(other)),
        })
    }
}

impl From<ErrorCode> for u32 {
    fn from(c: ErrorCode) -> u32 {
        c as u32
    }
}

/// Authentication method identifier, the first byte of the 4-byte selection
/// a tenant sends after the link reply.
///
/// A newtype rather than an enum: any byte can arrive on the wire, and an
/// unknown one must still be reported back to the tenant as unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthMethod(pub u8);

impl AuthMethod {
    /// RSA-encrypted ticket (password).
    pub const SPICE: AuthMethod = AuthMethod(1);
    /// External identity provider.
    pub const SASL: AuthMethod = AuthMethod(2);

    /// The 4-byte selection as sent on the wire.
    pub fn to_selection(self) -> [u8; 4] {
        (self.0 as u32).to_le_bytes()
    }

    pub fn from_selection(bytes: [u8; 4]) -> Self {
        AuthMethod(bytes[0])
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AuthMethod::SPICE => write!(f, "spice"),
            AuthMethod::SASL => write!(f, "sasl"),
            AuthMethod(other) => write!(f, "unknown(0x{other:02x})"),
        }
    }
}

// ── Client Link Message ───────────────────────────────────────────────────────

/// Fixed part of the link message a client sends first.
///
/// Wire size: 18 bytes, followed by capability words at `caps_offset`.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct ClientLinkFixed {
    connection_id: LeU32,
    channel_type: u8,
    channel_id: u8,
    num_common_caps: LeU32,
    num_channel_caps: LeU32,
    caps_offset: LeU32,
}

assert_eq_size!(ClientLinkFixed, [u8; 18]);

/// Decoded client link message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLinkMessage {
    /// Session the channel belongs to. [`NEW_SESSION_ID`] on a fresh main channel.
    pub session_id: u32,
    pub channel_type: ChannelType,
    pub channel_id: u8,
    pub common_caps: Vec<u32>,
    pub channel_caps: Vec<u32>,
}

impl ClientLinkMessage {
    pub fn encode(&self) -> Vec<u8> {
        let fixed = ClientLinkFixed {
            connection_id: LeU32::new(self.session_id),
            channel_type: self.channel_type.into(),
            channel_id: self.channel_id,
            num_common_caps: LeU32::new(self.common_caps.len() as u32),
            num_channel_caps: LeU32::new(self.channel_caps.len() as u32),
            caps_offset: LeU32::new(std::mem::size_of::<ClientLinkFixed>() as u32),
        };
        let mut out = fixed.as_bytes().to_vec();
        encode_caps(&mut out, &self.common_caps, &self.channel_caps);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let fixed = ClientLinkFixed::read_from_prefix(body).ok_or(WireError::Truncated {
            what: "client link message",
            need: std::mem::size_of::<ClientLinkFixed>(),
            got: body.len(),
        })?;
        let (common_caps, channel_caps) = decode_caps(
            body,
            fixed.caps_offset.get(),
            fixed.num_common_caps.get(),
            fixed.num_channel_caps.get(),
        )?;
        Ok(Self {
            session_id: fixed.connection_id.get(),
            channel_type: ChannelType::try_from(fixed.channel_type)?,
            channel_id: fixed.channel_id,
            common_caps,
            channel_caps,
        })
    }
}

// ── Server Link Reply ─────────────────────────────────────────────────────────

/// Fixed part of the server's link reply.
///
/// Wire size: 178 bytes, followed by capability words at `caps_offset`.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct ServerLinkFixed {
    error: LeU32,
    pub_key: [u8; TICKET_PUBKEY_BYTES],
    num_common_caps: LeU32,
    num_channel_caps: LeU32,
    caps_offset: LeU32,
}

assert_eq_size!(ServerLinkFixed, [u8; 178]);

/// Decoded server link reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLinkMessage {
    pub error: ErrorCode,
    /// SubjectPublicKeyInfo DER of the server's ticket key, zero-padded.
    pub pub_key: [u8; TICKET_PUBKEY_BYTES],
    pub common_caps: Vec<u32>,
    pub channel_caps: Vec<u32>,
}

impl ServerLinkMessage {
    /// Offset of the capability words: the size of the fixed part.
    pub const CAPS_OFFSET: u32 = std::mem::size_of::<ServerLinkFixed>() as u32;

    /// Encoded body length. This is what the preceding header must declare.
    pub fn encoded_len(&self) -> u32 {
        Self::CAPS_OFFSET + 4 * (self.common_caps.len() + self.channel_caps.len()) as u32
    }

    /// Header announcing this reply.
    pub fn header(&self) -> LinkHeader {
        LinkHeader::new(self.encoded_len())
    }

    pub fn encode(&self) -> Vec<u8> {
        let fixed = ServerLinkFixed {
            error: LeU32::new(self.error.into()),
            pub_key: self.pub_key,
            num_common_caps: LeU32::new(self.common_caps.len() as u32),
            num_channel_caps: LeU32::new(self.channel_caps.len() as u32),
            caps_offset: LeU32::new(Self::CAPS_OFFSET),
        };
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        out.extend_from_slice(fixed.as_bytes());
        encode_caps(&mut out, &self.common_caps, &self.channel_caps);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let fixed = ServerLinkFixed::read_from_prefix(body).ok_or(WireError::Truncated {
            what: "server link message",
            need: std::mem::size_of::<ServerLinkFixed>(),
            got: body.len(),
        })?;
        let (common_caps, channel_caps) = decode_caps(
            body,
            fixed.caps_offset.get(),
            fixed.num_common_caps.get(),
            fixed.num_channel_caps.get(),
        )?;
        Ok(Self {
            error: ErrorCode::try_from(fixed.error.get())?,
            pub_key: fixed.pub_key,
            common_caps,
            channel_caps,
        })
    }
}

fn encode_caps(out: &mut Vec<u8>, common: &[u32], channel: &[u32]) {
    for word in common.iter().chain(channel) {
        out.extend_from_slice(&word.to_le_bytes());
    }
}

fn decode_caps(
    body: &[u8],
    offset: u32,
    num_common: u32,
    num_channel: u32,
) -> Result<(Vec<u32>, Vec<u32>), WireError> {
    let total = num_common as usize + num_channel as usize;
    let start = offset as usize;
    let end = total
        .checked_mul(4)
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= body.len())
        .ok_or(WireError::BadCapsOffset {
            offset,
            count: total as u32,
            body: body.len(),
        })?;
    let mut words: Vec<u32> = body[start..end]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let channel = words.split_off(num_common as usize);
    Ok((words, channel))
}

// ── Server Ticket ─────────────────────────────────────────────────────────────

/// Result of an authentication attempt. Sent bare, without a link header.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ServerTicket {
    result: LeU32,
}

assert_eq_size!(ServerTicket, [u8; 4]);

pub const SERVER_TICKET_SIZE: usize = std::mem::size_of::<ServerTicket>();

impl ServerTicket {
    pub fn new(result: ErrorCode) -> Self {
        Self {
            result: LeU32::new(result.into()),
        }
    }

    pub fn result(&self) -> Result<ErrorCode, WireError> {
        ErrorCode::try_from(self.result.get())
    }
}

// ── Data Headers ──────────────────────────────────────────────────────────────

/// Data-message header used once both ends negotiated `MINI_HEADER`.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct MiniDataHeader {
    msg_type: LeU16,
    size: LeU32,
}

assert_eq_size!(MiniDataHeader, [u8; 6]);

/// Full data-message header, used when `MINI_HEADER` was not negotiated.
///
/// Wire size: 18 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct DataHeader {
    serial: LeU64,
    msg_type: LeU16,
    size: LeU32,
    sub_list: LeU32,
}

assert_eq_size!(DataHeader, [u8; 18]);

/// The two header forms, reduced to what the relay needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataMessageInfo {
    pub msg_type: u16,
    pub size: u32,
}

impl MiniDataHeader {
    pub fn new(msg_type: u16, size: u32) -> Self {
        Self {
            msg_type: LeU16::new(msg_type),
            size: LeU32::new(size),
        }
    }
}

impl DataHeader {
    pub fn new(serial: u64, msg_type: u16, size: u32) -> Self {
        Self {
            serial: LeU64::new(serial),
            msg_type: LeU16::new(msg_type),
            size: LeU32::new(size),
            sub_list: LeU32::new(0),
        }
    }
}

/// Size of the data header for the negotiated mode.
pub fn data_header_size(mini: bool) -> usize {
    if mini {
        std::mem::size_of::<MiniDataHeader>()
    } else {
        std::mem::size_of::<DataHeader>()
    }
}

/// Parse a data header of the negotiated form.
pub fn decode_data_header(bytes: &[u8], mini: bool) -> Result<DataMessageInfo, WireError> {
    let truncated = WireError::Truncated {
        what: "data header",
        need: data_header_size(mini),
        got: bytes.len(),
    };
    let info = if mini {
        let h = MiniDataHeader::read_from(bytes).ok_or(truncated)?;
        DataMessageInfo {
            msg_type: h.msg_type.get(),
            size: h.size.get(),
        }
    } else {
        let h = DataHeader::read_from(bytes).ok_or(truncated)?;
        DataMessageInfo {
            msg_type: h.msg_type.get(),
            size: h.size.get(),
        }
    };
    if info.size > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(info.size));
    }
    Ok(info)
}

/// Session id carried in the first four bytes of a `MSG_MAIN_INIT` body.
pub fn main_init_session_id(body: &[u8]) -> Result<u32, WireError> {
    match body {
        [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => Err(WireError::Truncated {
            what: "main init",
            need: 4,
            got: body.len(),
        }),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("{what} truncated: need {need} bytes, got {got}")]
    Truncated {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("bad link magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported protocol major version {0}")]
    VersionMismatch(u32),

    #[error("message size {0} exceeds maximum {}", MAX_MESSAGE_SIZE)]
    TooLarge(u32),

    #[error("unknown channel type: {0}")]
    UnknownChannelType(u8),

    #[error("unknown link error code: {0}")]
    UnknownErrorCode(u32),

    #[error("capabilities at offset {offset} (count {count}) overrun body of {body} bytes")]
    BadCapsOffset { offset: u32, count: u32, body: usize },

    #[error("unexpected message type {got}, expected {expected}")]
    UnexpectedMessage { expected: u16, got: u16 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
