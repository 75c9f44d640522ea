pub mod auth;
pub mod framer;
pub mod session;
pub mod ticket;

pub use auth::{AuthContext, AuthOutcome, AuthRegistry, Authenticator, TenantStream};
pub use framer::FrameError;
pub use session::{new_session_table, SessionEntry, SessionError, SessionStore, SessionTable};
pub use ticket::TicketAuthenticator;
