//! SPICE ticket authentication.
//!
//! The tenant encrypts its password (plus a NUL) under the ephemeral key from
//! the link reply and sends the raw ciphertext. A resumed session must
//! present its one-time password; a new session must present one of the
//! configured tickets, which also names the compute host.

use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt};

use spicegate_core::config::TicketEntry;
use spicegate_core::wire::AuthMethod;

use crate::auth::{AuthContext, AuthOutcome, Authenticator};
use crate::framer::read_exact_accumulating;

pub struct TicketAuthenticator {
    tickets: HashMap<String, TicketEntry>,
}

impl TicketAuthenticator {
    pub fn new(entries: impl IntoIterator<Item = TicketEntry>) -> Self {
        let tickets = entries
            .into_iter()
            .map(|e| (e.password.clone(), e))
            .collect();
        Self { tickets }
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    async fn authenticate(&self, ctx: &mut AuthContext<'_>) -> anyhow::Result<AuthOutcome> {
        let ciphertext = read_exact_accumulating(&mut *ctx.tenant, ctx.keypair.ticket_len()).await?;

        let password = match ctx.keypair.decrypt_ticket(&ciphertext) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "undecryptable ticket");
                return Ok(AuthOutcome::reject());
            }
        };

        if !ctx.otp.is_empty() {
            if password.as_str() != ctx.otp {
                tracing::debug!("ticket does not match session password");
                return Ok(AuthOutcome::reject());
            }
            return Ok(AuthOutcome::accept(ctx.destination.clone()));
        }

        match self.tickets.get(password.as_str()) {
            Some(entry) => {
                ctx.otp = entry.otp.clone().unwrap_or_else(|| password.to_string());
                Ok(AuthOutcome::accept(entry.destination.clone()))
            }
            None => {
                tracing::debug!("ticket matches no configured entry");
                Ok(AuthOutcome::reject())
            }
        }
    }
}

impl Authenticator for TicketAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::SPICE
    }

    fn next<'a>(&'a self, ctx: &'a mut AuthContext<'_>) -> BoxFuture<'a, anyhow::Result<AuthOutcome>> {
        self.authenticate(ctx).boxed()
    }
}
