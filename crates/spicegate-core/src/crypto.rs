//! Ticket cryptography for the SPICE link handshake.
//!
//! Provides two things:
//!   1. An ephemeral RSA-1024 keypair, generated per handshake, whose public
//!      half travels in the server link reply and whose private half decrypts
//!      the tenant's ticket.
//!   2. The initiating side: encrypting a ticket (password) under the public
//!      key a compute host sent us.
//!
//! Tickets are RSA-OAEP with SHA-1, as every SPICE peer expects. The key
//! travels as SubjectPublicKeyInfo DER in a fixed 162-byte slot.
//!
//! Private key material is zeroized on drop by the `rsa` crate, and decrypted
//! passwords are handed out as `Zeroizing<String>`.
//! There is no unsafe code in this module.

use rand::thread_rng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::wire::TICKET_PUBKEY_BYTES;

/// Modulus size of the ticket key. Fixed by the 162-byte slot on the wire.
pub const RSA_KEY_BITS: usize = 1024;

/// Longest password a SPICE client will put in a ticket.
pub const MAX_PASSWORD_LEN: usize = 60;

// ── Ephemeral Keypair ─────────────────────────────────────────────────────────

/// A per-handshake RSA keypair.
///
/// Created when the link reply is built and owned by exactly one handshake.
/// Never persisted, never reused across sessions.
pub struct EphemeralKeypair {
    private: RsaPrivateKey,
    public_slot: [u8; TICKET_PUBKEY_BYTES],
}

impl EphemeralKeypair {
    /// Generate a fresh keypair and encode its public half for the wire.
    pub fn generate() -> Result<Self, CryptoError> {
        let private =
            RsaPrivateKey::new(&mut thread_rng(), RSA_KEY_BITS).map_err(CryptoError::KeyGen)?;
        let der = RsaPublicKey::from(&private).to_public_key_der()?;
        let der = der.as_bytes();
        if der.len() > TICKET_PUBKEY_BYTES {
            return Err(CryptoError::KeyTooLarge(der.len()));
        }

        let mut public_slot = [0u8; TICKET_PUBKEY_BYTES];
        public_slot[..der.len()].copy_from_slice(der);
        Ok(Self {
            private,
            public_slot,
        })
    }

    /// Public key as it goes into `ServerLinkMessage::pub_key`.
    pub fn public_slot(&self) -> [u8; TICKET_PUBKEY_BYTES] {
        self.public_slot
    }

    /// Ciphertext length a ticket under this key has.
    pub fn ticket_len(&self) -> usize {
        self.private.size()
    }

    /// Decrypt a tenant's ticket. The password ends at the first NUL.
    pub fn decrypt_ticket(&self, ciphertext: &[u8]) -> Result<Zeroizing<String>, CryptoError> {
        let plain = Zeroizing::new(
            self.private
                .decrypt(Oaep::new::<Sha1>(), ciphertext)
                .map_err(CryptoError::Decrypt)?,
        );
        let end = plain.iter().position(|b| *b == 0).unwrap_or(plain.len());
        let password = std::str::from_utf8(&plain[..end]).map_err(|_| CryptoError::NotUtf8)?;
        Ok(Zeroizing::new(password.to_owned()))
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("bits", &(self.private.size() * 8))
            .finish_non_exhaustive()
    }
}

// ── Peer Public Key ───────────────────────────────────────────────────────────

/// A ticket key received from a server's link reply.
#[derive(Debug, Clone)]
pub struct TicketPublicKey(RsaPublicKey);

impl TicketPublicKey {
    /// Parse the DER held in a link reply's key slot. Trailing padding after
    /// the DER structure is ignored.
    pub fn from_slot(slot: &[u8]) -> Result<Self, CryptoError> {
        let len = der_sequence_len(slot)
            .filter(|len| *len <= slot.len())
            .ok_or(CryptoError::MalformedSlot)?;
        Ok(Self(RsaPublicKey::from_public_key_der(&slot[..len])?))
    }

    /// Encrypt `password` as a ticket: the password plus a terminating NUL.
    pub fn encrypt_ticket(&self, password: &str) -> Result<Vec<u8>, CryptoError> {
        if password.len() > MAX_PASSWORD_LEN {
            return Err(CryptoError::PasswordTooLong(password.len()));
        }
        let mut plain = Zeroizing::new(Vec::with_capacity(password.len() + 1));
        plain.extend_from_slice(password.as_bytes());
        plain.push(0);
        self.0
            .encrypt(&mut thread_rng(), Oaep::new::<Sha1>(), &plain)
            .map_err(CryptoError::Encrypt)
    }
}

/// Total length of the outer DER SEQUENCE at the start of `bytes`.
fn der_sequence_len(bytes: &[u8]) -> Option<usize> {
    match bytes {
        [0x30, len @ 0..=0x7f, ..] => Some(2 + *len as usize),
        [0x30, 0x81, len, ..] => Some(3 + *len as usize),
        [0x30, 0x82, hi, lo, ..] => Some(4 + u16::from_be_bytes([*hi, *lo]) as usize),
        _ => None,
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGen(rsa::Error),

    #[error("public key DER error: {0}")]
    Der(#[from] rsa::pkcs8::spki::Error),

    #[error("encoded public key is {0} bytes, slot holds {}", TICKET_PUBKEY_BYTES)]
    KeyTooLarge(usize),

    #[error("public key slot does not start with a DER sequence")]
    MalformedSlot,

    #[error("ticket encryption failed: {0}")]
    Encrypt(rsa::Error),

    #[error("ticket decryption failed: {0}")]
    Decrypt(rsa::Error),

    #[error("ticket password is not UTF-8")]
    NotUtf8,

    #[error("password of {0} bytes exceeds {} byte limit", MAX_PASSWORD_LEN)]
    PasswordTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
