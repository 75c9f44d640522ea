use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use spicegate_core::crypto::TicketPublicKey;
use spicegate_core::wire::{ChannelType, ErrorCode, MSG_MAIN_INIT, RELAY_CHANNEL_CAPS, RELAY_COMMON_CAPS};
use spicegate_proxy::testing::{FakeCompute, FakeComputeConfig};
use spicegate_services::SessionStore;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Successful sessions
// ══════════════════════════════════════════════════════════════════════════════

/// New main channel: link, SPICE auth, compute handshake, registration, splice.
#[tokio::test]
async fn test_new_session_end_to_end() {
    let compute = FakeCompute::start(FakeComputeConfig {
        assign_session_id: 0x51,
        password: Some("alpha".into()),
        ..Default::default()
    })
    .await
    .unwrap();
    let relay = Relay::start(vec![ticket("alpha", compute.addr())], Duration::from_secs(5))
        .await
        .unwrap();

    let mut tenant = relay.connect().await.unwrap();
    let (reply, code) = tenant_handshake(&mut tenant, 0, ChannelType::Main, "alpha")
        .await
        .unwrap();

    assert_eq!(reply.error, ErrorCode::Ok);
    assert_eq!(reply.common_caps, vec![RELAY_COMMON_CAPS]);
    assert_eq!(reply.channel_caps, vec![RELAY_CHANNEL_CAPS]);
    assert!(TicketPublicKey::from_slot(&reply.pub_key).is_ok());
    assert_eq!(code, ErrorCode::Ok);

    // The compute host's main init arrives untouched.
    let mut init = [0u8; MAIN_INIT_LEN];
    tenant.read_exact(&mut init).await.unwrap();
    assert_eq!(&init[..2], &MSG_MAIN_INIT.to_le_bytes());
    assert_eq!(&init[6..10], &0x51u32.to_le_bytes());

    assert_eq!(relay.sessions.connect(0x51).unwrap(), compute.addr().to_string());
    assert_eq!(relay.sessions.otp(0x51), "alpha");

    // Spliced: the fake compute host echoes.
    tenant.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    tenant.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping");

    let stats = relay.proxy.stats().snapshot();
    assert_eq!((stats.accepted, stats.established, stats.failed), (1, 1, 0));
}

/// A second channel of an existing session is routed by the session table
/// and authenticates with the session's one-time password.
#[tokio::test]
async fn test_secondary_channel_joins_session() {
    let compute = FakeCompute::start(FakeComputeConfig {
        assign_session_id: 0x99,
        password: Some("beta-otp".into()),
        ..Default::default()
    })
    .await
    .unwrap();
    let mut entry = ticket("beta", compute.addr());
    entry.otp = Some("beta-otp".into());
    let relay = Relay::start(vec![entry], Duration::from_secs(5)).await.unwrap();

    let mut main = relay.connect().await.unwrap();
    let (_, code) = tenant_handshake(&mut main, 0, ChannelType::Main, "beta").await.unwrap();
    assert_eq!(code, ErrorCode::Ok);
    let mut init = [0u8; MAIN_INIT_LEN];
    main.read_exact(&mut init).await.unwrap();

    let mut display = relay.connect().await.unwrap();
    let (_, code) = tenant_handshake(&mut display, 0x99, ChannelType::Display, "beta-otp")
        .await
        .unwrap();
    assert_eq!(code, ErrorCode::Ok);

    display.write_all(b"frame").await.unwrap();
    let mut echo = [0u8; 5];
    display.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"frame");

    let seen = compute.seen().await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].link.session_id, 0x99);
    assert_eq!(seen[1].link.channel_type, ChannelType::Display);
    assert_eq!(relay.sessions.len(), 1);
}

/// Tenants are served concurrently; each gets its own key.
#[tokio::test]
async fn test_concurrent_tenants() {
    let compute = FakeCompute::start(FakeComputeConfig::default()).await.unwrap();
    let relay = Relay::start(vec![ticket("gamma", compute.addr())], Duration::from_secs(5))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let mut tenant = relay.connect().await.unwrap();
        handles.push(tokio::spawn(async move {
            let (reply, code) = tenant_handshake(&mut tenant, 0, ChannelType::Main, "gamma")
                .await
                .unwrap();
            (reply.pub_key, code)
        }));
    }

    let mut keys = Vec::new();
    for h in handles {
        let (key, code) = h.await.unwrap();
        assert_eq!(code, ErrorCode::Ok);
        keys.push(key);
    }
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 4);

    assert!(eventually(Duration::from_secs(5), || compute.accepted() == 4).await);
}
