//! The relay itself: both handshake state machines and the coordinator that
//! drives them and splices the resulting connections.

pub mod error;
pub mod handshake;
pub mod proxy;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::HandshakeError;
pub use handshake::{ComputeHandshake, ComputeLink, ComputeTarget, TenantHandshake};
pub use proxy::{Proxy, ProxyStats, StatsSnapshot};
