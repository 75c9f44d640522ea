//! The two halves of a relayed SPICE link handshake.
//!
//! [`TenantHandshake`] answers the tenant as if it were the server. Once the
//! tenant is authenticated and its destination known, it drives a
//! [`ComputeHandshake`], which replays the negotiation against the compute
//! host as if it were the client. Both advance one bounded unit of I/O per
//! `step()` so the caller can put a deadline on every step.

pub mod compute;
pub mod tenant;

pub use compute::{ComputeHandshake, ComputeLink, ComputeState, ComputeTarget};
pub use tenant::{TenantHandshake, TenantState};
