//! Authentication strategies and the registry that selects between them.
//!
//! After the link reply a tenant names an [`AuthMethod`]. The handshake looks
//! that method up in an [`AuthRegistry`] and hands the tenant stream to the
//! matching [`Authenticator`], which runs its own exchange and reports
//! whether the tenant may proceed and where to.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use spicegate_core::crypto::EphemeralKeypair;
use spicegate_core::wire::AuthMethod;

/// A bidirectional byte stream to a tenant.
pub trait TenantStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TenantStream for T {}

/// State a strategy may read and update while it runs.
pub struct AuthContext<'a> {
    pub tenant: &'a mut dyn TenantStream,
    /// The handshake's ephemeral key, already sent to the tenant.
    pub keypair: &'a EphemeralKeypair,
    /// Password of the session being resumed. Empty for a new session.
    /// A strategy sets it for new sessions; it is what the compute host
    /// will be asked for.
    pub otp: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub accepted: bool,
    pub destination: String,
}

impl AuthOutcome {
    pub fn accept(destination: impl Into<String>) -> Self {
        Self {
            accepted: true,
            destination: destination.into(),
        }
    }

    pub fn reject() -> Self {
        Self {
            accepted: false,
            destination: String::new(),
        }
    }
}

/// One authentication method.
///
/// `next` owns the tenant stream for the duration of its exchange. It
/// returns `Ok` with `accepted == false` for a tenant that failed to prove
/// itself, and `Err` only when the strategy itself broke.
pub trait Authenticator: Send + Sync {
    fn method(&self) -> AuthMethod;

    fn next<'a>(&'a self, ctx: &'a mut AuthContext<'_>) -> BoxFuture<'a, anyhow::Result<AuthOutcome>>;
}

/// Maps method identifiers to strategies. Built once at startup.
#[derive(Default)]
pub struct AuthRegistry {
    strategies: HashMap<AuthMethod, Arc<dyn Authenticator>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy under its own method, replacing any previous one.
    pub fn register(&mut self, strategy: Arc<dyn Authenticator>) {
        let method = strategy.method();
        if self.strategies.insert(method, strategy).is_some() {
            tracing::warn!(%method, "authenticator replaced");
        }
    }

    pub fn lookup(&self, method: AuthMethod) -> Option<Arc<dyn Authenticator>> {
        self.strategies.get(&method).cloned()
    }

    /// Registered methods, ascending.
    pub fn methods(&self) -> Vec<AuthMethod> {
        let mut methods: Vec<_> = self.strategies.keys().copied().collect();
        methods.sort();
        methods
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl std::fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct Fixed(AuthMethod, bool);

    impl Authenticator for Fixed {
        fn method(&self) -> AuthMethod {
            self.0
        }

        fn next<'a>(&'a self, ctx: &'a mut AuthContext<'_>) -> BoxFuture<'a, anyhow::Result<AuthOutcome>> {
            async move {
                ctx.otp = "set-by-strategy".into();
                Ok(if self.1 {
                    AuthOutcome::accept("host:1")
                } else {
                    AuthOutcome::reject()
                })
            }
            .boxed()
        }
    }

    #[test]
    fn empty_registry() {
        let registry = AuthRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.lookup(AuthMethod::SPICE).is_none());
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(Fixed(AuthMethod::SASL, true)));
        registry.register(Arc::new(Fixed(AuthMethod::SPICE, true)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.methods(), vec![AuthMethod::SPICE, AuthMethod::SASL]);
        assert_eq!(
            registry.lookup(AuthMethod::SASL).map(|s| s.method()),
            Some(AuthMethod::SASL)
        );
        assert!(registry.lookup(AuthMethod(0xff)).is_none());
    }

    #[test]
    fn register_replaces_same_method() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(Fixed(AuthMethod::SPICE, true)));
        registry.register(Arc::new(Fixed(AuthMethod::SPICE, false)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn strategy_updates_context() {
        let keypair = EphemeralKeypair::generate().unwrap();
        let (mut stream, _peer) = tokio::io::duplex(16);
        let mut ctx = AuthContext {
            tenant: &mut stream,
            keypair: &keypair,
            otp: String::new(),
            destination: String::new(),
        };

        let outcome = Fixed(AuthMethod::SPICE, true).next(&mut ctx).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.destination, "host:1");
        assert_eq!(ctx.otp, "set-by-strategy");
    }
}
