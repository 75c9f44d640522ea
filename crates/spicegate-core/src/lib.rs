//! spicegate-core: wire format, ticket cryptography and configuration.
//! All other spicegate crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use wire::{AuthMethod, ChannelType, ErrorCode, WireError};
