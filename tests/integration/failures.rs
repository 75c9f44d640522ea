use std::time::Duration;

use tokio::io::AsyncWriteExt;

use spicegate_core::wire::{AuthMethod, ChannelType, ErrorCode, RELAY_COMMON_CAPS};
use spicegate_proxy::testing::{self, FakeCompute, FakeComputeConfig};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Rejected and broken tenants
// ══════════════════════════════════════════════════════════════════════════════

/// Wrong password: one denial ticket, connection closed, nothing registered,
/// compute host never contacted.
#[tokio::test]
async fn test_wrong_password_is_denied() {
    let compute = FakeCompute::start(FakeComputeConfig::default()).await.unwrap();
    let relay = Relay::start(vec![ticket("alpha", compute.addr())], Duration::from_secs(5))
        .await
        .unwrap();

    let mut tenant = relay.connect().await.unwrap();
    let (_, code) = tenant_handshake(&mut tenant, 0, ChannelType::Main, "wrong")
        .await
        .unwrap();
    assert_eq!(code, ErrorCode::PermissionDenied);

    let rest = read_until_closed(&mut tenant, Duration::from_secs(5)).await.unwrap();
    assert!(rest.is_empty());
    assert!(relay.sessions.is_empty());
    assert_eq!(compute.accepted(), 0);
    assert!(eventually(Duration::from_secs(2), || relay.proxy.stats().snapshot().failed == 1).await);
}

/// SASL is not registered, so selecting it is refused.
#[tokio::test]
async fn test_unregistered_method_is_denied() {
    let relay = Relay::start(vec![], Duration::from_secs(5)).await.unwrap();

    let mut tenant = relay.connect().await.unwrap();
    testing::send_link(&mut tenant, 0, ChannelType::Main, vec![RELAY_COMMON_CAPS])
        .await
        .unwrap();
    testing::select_method(&mut tenant, AuthMethod::SASL).await.unwrap();

    let rest = read_until_closed(&mut tenant, Duration::from_secs(5)).await.unwrap();
    assert_eq!(rest, 7u32.to_le_bytes());
    assert!(relay.sessions.is_empty());
}

/// Not SPICE at all: closed without a reply.
#[tokio::test]
async fn test_garbage_gets_no_reply() {
    let relay = Relay::start(vec![], Duration::from_secs(5)).await.unwrap();

    let mut tenant = relay.connect().await.unwrap();
    tenant.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();

    let rest = read_until_closed(&mut tenant, Duration::from_secs(5)).await.unwrap();
    assert!(rest.is_empty());
}

/// A tenant that connects and says nothing is dropped after one step timeout.
#[tokio::test]
async fn test_silent_tenant_times_out() {
    let relay = Relay::start(vec![], Duration::from_millis(200)).await.unwrap();

    let mut tenant = relay.connect().await.unwrap();
    let rest = read_until_closed(&mut tenant, Duration::from_secs(5)).await.unwrap();
    assert!(rest.is_empty());
}

/// Compute host unreachable after the tenant was accepted.
#[tokio::test]
async fn test_unreachable_compute_closes_tenant() {
    // Bind then drop to get a port nobody listens on.
    let dead = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let relay = Relay::start(vec![ticket("alpha", dead)], Duration::from_secs(5))
        .await
        .unwrap();

    let mut tenant = relay.connect().await.unwrap();
    let (_, code) = tenant_handshake(&mut tenant, 0, ChannelType::Main, "alpha")
        .await
        .unwrap();
    assert_eq!(code, ErrorCode::Ok);

    let rest = read_until_closed(&mut tenant, Duration::from_secs(5)).await.unwrap();
    assert!(rest.is_empty());
    assert!(relay.sessions.is_empty());
}
