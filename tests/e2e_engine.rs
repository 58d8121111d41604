//! End-to-end engine tests.
//!
//! Two engines talk over the in-process transport and signaler; tests that
//! need to script one side drive the raw signaler directly instead.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use tandem::config::{Config, EngineConfig};
use tandem::signal::Signaler;
use tandem::socket::Message;
use tandem::transaction::sized;
use tandem::transport::memory::MemoryPeer;
use tandem::transport::{
    Connector, PeerConnection, PeerConnectionState, RtcConfiguration, SignalingState,
};
use tandem::{
    ConnectionState, Engine, EngineEvent, EventSource, Hook, LocalSignaler, Role, SocketEvent,
    TandemError,
};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn connector(pc: Arc<MemoryPeer>) -> impl Connector {
    move |rtc: &RtcConfiguration| {
        pc.configure(rtc);
        Ok::<_, TandemError>(Arc::clone(&pc) as Arc<dyn PeerConnection>)
    }
}

struct Peers {
    a: Engine,
    b: Engine,
    pc_a: Arc<MemoryPeer>,
    sig_a: Arc<LocalSignaler>,
}

fn engines(config: EngineConfig) -> Peers {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, pc_b) = MemoryPeer::pair();

    let a = Engine::new(sig_a.clone(), &connector(pc_a.clone()), config.clone()).unwrap();
    let b = Engine::new(sig_b, &connector(pc_b), config).unwrap();
    Peers { a, b, pc_a, sig_a }
}

async fn connected(config: EngineConfig) -> Peers {
    let peers = engines(config);
    timeout(TIMEOUT, async { tokio::try_join!(peers.a.connect(), peers.b.connect()) })
        .await
        .expect("connect timed out")
        .expect("connect failed");
    peers
}

async fn next_of_type(messages: &mut BoxStream<'static, tandem::Result<Value>>, kind: &str) -> Value {
    timeout(TIMEOUT, async {
        loop {
            let message = messages.next().await.expect("signaler closed").unwrap();
            if message["type"] == kind {
                return message;
            }
        }
    })
    .await
    .expect("no message of the expected type")
}

/// Everything the engine sends within `window`
async fn drain(messages: &mut BoxStream<'static, tandem::Result<Value>>, window: Duration) -> Vec<Value> {
    let mut sent = Vec::new();
    while let Ok(Some(message)) = timeout(window, messages.next()).await {
        sent.push(message.unwrap());
    }
    sent
}

fn remote_offer() -> Value {
    json!({"type": "description", "description": {"type": "offer", "sdp": "v=0 remote"}})
}

fn remote_candidate() -> Value {
    json!({"type": "icecandidate", "candidate": {"candidate": "candidate:7 1 udp 2122260223 10.0.0.7 9007 typ host"}})
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_engines_connect_with_opposite_roles() {
    let peers = connected(EngineConfig::default()).await;

    let (role_a, role_b) = (peers.a.role().unwrap(), peers.b.role().unwrap());
    assert_eq!(role_a.opposite(), role_b);
    assert_eq!(peers.a.connection(), ConnectionState::Connected);
    assert_eq!(peers.b.connection(), ConnectionState::Connected);

    let hooks = peers.sig_a.hooks();
    assert_eq!(hooks.first(), Some(&Hook::Start));
    assert!(hooks.contains(&Hook::Connected));
}

#[tokio::test]
async fn test_ice_servers_reach_transport() {
    let peers = engines(EngineConfig::default());
    let rtc = peers.pc_a.configuration();
    assert_eq!(rtc.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
}

#[tokio::test]
async fn test_connect_starts_inactive_engine() {
    let config = EngineConfig {
        auto_connect: false,
        ..EngineConfig::default()
    };
    let peers = engines(config);
    assert_eq!(peers.a.connection(), ConnectionState::Inactive);
    assert_eq!(peers.a.role(), None);

    timeout(TIMEOUT, async { tokio::try_join!(peers.a.connect(), peers.b.connect()) })
        .await
        .unwrap()
        .unwrap();
    assert!(peers.a.role().is_some());
}

#[tokio::test]
async fn test_larger_remote_seed_makes_us_impolite() {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();
    let mut inbox = sig_b.messages().unwrap();

    // The remote seed arrives before this engine has rolled its own
    sig_b.send(json!({"type": "role", "seed": 10})).await.unwrap();
    let engine = Engine::new(sig_a, &connector(pc_a), EngineConfig::default()).unwrap();

    let role = timeout(TIMEOUT, engine.watch_role().wait(Option::is_some))
        .await
        .unwrap();
    assert_eq!(role, Some(Role::Impolite));

    let seed = next_of_type(&mut inbox, "role").await;
    assert!(seed["seed"].as_f64().unwrap() < 1.0);

    // The impolite peer opens the initiator channel, which triggers an offer
    let offer = next_of_type(&mut inbox, "description").await;
    assert_eq!(offer["description"]["type"], "offer");
}

#[tokio::test]
async fn test_role_message_while_assigned_rerolls() {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();
    let mut inbox = sig_b.messages().unwrap();

    sig_b.send(json!({"type": "role", "seed": 10})).await.unwrap();
    let engine = Engine::new(sig_a, &connector(pc_a), EngineConfig::default()).unwrap();
    timeout(TIMEOUT, engine.watch_role().wait_for(Some(Role::Impolite)))
        .await
        .unwrap();
    let first = next_of_type(&mut inbox, "role").await;

    // A restarted peer sends a fresh seed; this side must re-roll and answer it
    sig_b.send(json!({"type": "role", "seed": -1.0})).await.unwrap();
    let second = next_of_type(&mut inbox, "role").await;
    assert_ne!(first["seed"], second["seed"]);

    timeout(TIMEOUT, engine.watch_role().wait_for(Some(Role::Polite)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_equal_seeds_reroll() {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();
    let mut inbox = sig_b.messages().unwrap();

    let engine = Engine::new(sig_a, &connector(pc_a), EngineConfig::default()).unwrap();
    let first = next_of_type(&mut inbox, "role").await;

    sig_b.send(json!({"type": "role", "seed": first["seed"]})).await.unwrap();
    let second = next_of_type(&mut inbox, "role").await;
    assert_ne!(first["seed"], second["seed"]);
    assert_eq!(engine.role(), None);

    sig_b.send(json!({"type": "role", "seed": -1.0})).await.unwrap();
    timeout(TIMEOUT, engine.watch_role().wait_for(Some(Role::Polite)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_impolite_ignores_colliding_offer_and_its_candidates() {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();
    let mut inbox = sig_b.messages().unwrap();

    sig_b.send(json!({"type": "role", "seed": 10})).await.unwrap();
    let engine = Engine::new(sig_a, &connector(pc_a.clone()), EngineConfig::default()).unwrap();
    let mut events = engine.subscribe();

    let offer = next_of_type(&mut inbox, "description").await;
    assert_eq!(offer["description"]["type"], "offer");
    assert_eq!(pc_a.signaling_state(), SignalingState::HaveLocalOffer);

    sig_b.send(remote_offer()).await.unwrap();
    sig_b.send(remote_candidate()).await.unwrap();

    let sent = drain(&mut inbox, Duration::from_millis(100)).await;
    assert!(sent.iter().all(|message| message["type"] != "description"));
    assert_eq!(pc_a.signaling_state(), SignalingState::HaveLocalOffer);

    while let Some(event) = events.try_recv() {
        assert!(!matches!(event, EngineEvent::Error(_)), "unexpected {event:?}");
    }
}

#[tokio::test]
async fn test_polite_answers_colliding_offer() {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();
    let mut inbox = sig_b.messages().unwrap();

    let config = EngineConfig {
        role: Some(Role::Polite),
        ..EngineConfig::default()
    };
    let engine = Engine::new(sig_a, &connector(pc_a.clone()), config).unwrap();
    timeout(TIMEOUT, engine.watch_role().wait_for(Some(Role::Polite)))
        .await
        .unwrap();

    // Opening a channel makes this side offer too
    let opening = tokio::spawn({
        let engine = engine.clone();
        async move { engine.socket(None).await }
    });
    let offer = next_of_type(&mut inbox, "description").await;
    assert_eq!(offer["description"]["type"], "offer");

    sig_b.send(remote_offer()).await.unwrap();
    let answer = next_of_type(&mut inbox, "description").await;
    assert_eq!(answer["description"]["type"], "answer");
    assert_eq!(pc_a.signaling_state(), SignalingState::Stable);

    opening.abort();
}

#[tokio::test]
async fn test_rejected_candidate_is_reported() {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();

    let config = EngineConfig {
        role: Some(Role::Polite),
        ..EngineConfig::default()
    };
    let engine = Engine::new(sig_a, &connector(pc_a), config).unwrap();
    let mut events = engine.subscribe();

    // No remote description yet, so the transport refuses the candidate
    sig_b.send(remote_candidate()).await.unwrap();

    let message = timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(EngineEvent::Error(message)) => return message,
                Some(_) => continue,
                None => panic!("engine events ended"),
            }
        }
    })
    .await
    .unwrap();
    assert!(message.contains("remote description"));
    assert_ne!(engine.connection(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_fixed_role_skips_seed_exchange() {
    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();
    let mut inbox = sig_b.messages().unwrap();

    let config = EngineConfig {
        role: Some(Role::Polite),
        ..EngineConfig::default()
    };
    let engine = Engine::new(sig_a, &connector(pc_a), config).unwrap();
    timeout(TIMEOUT, engine.watch_role().wait_for(Some(Role::Polite)))
        .await
        .unwrap();

    sig_b.send(json!({"type": "role", "seed": 10})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.role(), Some(Role::Polite));
    assert!(timeout(Duration::from_millis(50), inbox.next()).await.is_err());
}

#[tokio::test]
async fn test_failed_restarts_ice_without_waiting_when_configured() {
    let config = EngineConfig {
        wait_online_on_reconnection: false,
        ..EngineConfig::default()
    };
    let peers = connected(config).await;
    peers.a.set_online(false);

    peers.pc_a.force_connection_state(PeerConnectionState::Failed);

    let pc_a = peers.pc_a.clone();
    eventually(move || pc_a.restart_count() == 1).await;
    timeout(TIMEOUT, peers.a.watch_connection().wait_for(ConnectionState::Connected))
        .await
        .unwrap();
    assert!(peers.sig_a.hooks().contains(&Hook::Failed));
}

#[tokio::test]
async fn test_failed_waits_for_network_before_restart() {
    let peers = connected(EngineConfig::default()).await;
    peers.a.set_online(false);

    peers.pc_a.force_connection_state(PeerConnectionState::Failed);
    timeout(TIMEOUT, peers.a.watch_connection().wait_for(ConnectionState::Failed))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peers.pc_a.restart_count(), 0);

    peers.a.set_online(true);
    let pc_a = peers.pc_a.clone();
    eventually(move || pc_a.restart_count() == 1).await;
}

#[tokio::test]
async fn test_connect_restarts_failed_connection() {
    let config = EngineConfig {
        wait_online_on_reconnection: true,
        ..EngineConfig::default()
    };
    let peers = connected(config).await;
    peers.a.set_online(false);
    peers.pc_a.force_connection_state(PeerConnectionState::Failed);
    timeout(TIMEOUT, peers.a.watch_connection().wait_for(ConnectionState::Failed))
        .await
        .unwrap();

    timeout(TIMEOUT, peers.a.connect()).await.unwrap().unwrap();
    assert_eq!(peers.pc_a.restart_count(), 1);
}

#[tokio::test]
async fn test_connect_and_network_recovery_restart_once() {
    let peers = connected(EngineConfig::default()).await;
    peers.a.set_online(false);
    peers.pc_a.force_connection_state(PeerConnectionState::Failed);
    timeout(TIMEOUT, peers.a.watch_connection().wait_for(ConnectionState::Failed))
        .await
        .unwrap();

    // The pending reconnect wakes up while connect() is already restarting
    let (connected, ()) = timeout(TIMEOUT, async {
        tokio::join!(peers.a.connect(), async { peers.a.set_online(true) })
    })
    .await
    .unwrap();
    connected.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peers.pc_a.restart_count(), 1);
}

#[tokio::test]
async fn test_negotiated_socket_exchanges_messages() {
    let peers = connected(EngineConfig::default()).await;

    let (sa, sb) = timeout(TIMEOUT, async {
        tokio::try_join!(peers.a.socket(Some("chat")), peers.b.socket(Some("chat")))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sa.label(), "chat");
    assert_eq!(sb.label(), "chat");

    let mut events = sb.subscribe();
    sa.write_json(&json!({"hello": "world"})).await.unwrap();
    let event = timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, SocketEvent::Message(Message::Json(json!({"hello": "world"}))));

    let stats = peers.a.stats(&sa).await.unwrap().unwrap();
    assert_eq!(stats.label, "chat");
    assert!(stats.messages_sent >= 1);
}

#[tokio::test]
async fn test_unnegotiated_socket_is_discovered() {
    let peers = connected(EngineConfig::default()).await;
    let mut inbound = peers.b.sockets();

    let socket = timeout(TIMEOUT, peers.a.socket(None)).await.unwrap().unwrap();
    let remote = timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(remote.label(), socket.label());
    assert!(socket.channel_label().starts_with("@socket/"));

    let mut events = remote.subscribe();
    socket.write_binary(vec![1u8, 2, 3]).await.unwrap();
    let event = timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, SocketEvent::Message(Message::Binary(vec![1u8, 2, 3].into())));
}

#[tokio::test]
async fn test_unnegotiated_transaction_is_discovered() {
    let peers = connected(EngineConfig::default()).await;
    let mut readables = peers.b.readables();

    let writer = timeout(TIMEOUT, peers.a.writable(None, sized(5)))
        .await
        .unwrap()
        .unwrap();
    let reader = timeout(TIMEOUT, readables.recv()).await.unwrap().unwrap();
    assert_eq!(reader.metadata()["size"], 5);

    writer.write(&b"hello"[..]).await.unwrap();
    writer.finish().await.unwrap();
    let data = timeout(TIMEOUT, reader.read_to_end()).await.unwrap().unwrap();
    assert_eq!(data, b"hello".to_vec());
}

#[tokio::test]
async fn test_reserved_labels_are_rejected() {
    let peers = connected(EngineConfig::default()).await;
    let err = peers.a.socket(Some("@initiator")).await.unwrap_err();
    assert!(matches!(err, TandemError::Protocol(_)));
}

#[tokio::test]
async fn test_fatal_signaling_error_is_emitted_and_closes() {
    let peers = connected(EngineConfig::default()).await;
    let mut events = peers.a.subscribe();

    peers.sig_a.fail("boom");

    let message = timeout(TIMEOUT, async {
        loop {
            if let Some(EngineEvent::Error(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert!(message.contains("boom"));

    timeout(TIMEOUT, peers.a.watch_connection().wait_for(ConnectionState::Closed))
        .await
        .unwrap();
    assert!(peers.sig_a.hooks().contains(&Hook::Close));
}

#[tokio::test]
async fn test_fatal_signaling_error_without_listener_fails_connect() {
    let peers = connected(EngineConfig::default()).await;
    peers.sig_a.fail("boom");

    timeout(TIMEOUT, peers.a.watch_connection().wait_for(ConnectionState::Closed))
        .await
        .unwrap();
    let err = peers.a.connect().await.unwrap_err();
    assert!(matches!(err, TandemError::Signaling(ref message) if message.contains("boom")));
}

#[tokio::test]
async fn test_close_ends_session() {
    let peers = connected(EngineConfig::default()).await;

    peers.a.close().await;
    assert_eq!(peers.a.connection(), ConnectionState::Closed);
    assert!(matches!(peers.a.connect().await, Err(TandemError::Closed)));
    assert_eq!(peers.sig_a.hooks().last(), Some(&Hook::Close));

    // The remote transport notices
    timeout(TIMEOUT, peers.b.watch_connection().wait_for(ConnectionState::Disconnected))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_config_file_drives_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tandem.toml");
    std::fs::write(
        &path,
        "[engine]\nautoConnect = false\nrole = \"impolite\"\n\n[transfer]\nchunk_size = 1024\n",
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    let (sig_a, _sig_b) = LocalSignaler::pair();
    let (pc_a, _pc_b) = MemoryPeer::pair();
    let engine = Engine::with_config(sig_a, &connector(pc_a), config).unwrap();

    assert_eq!(engine.connection(), ConnectionState::Inactive);
    assert_eq!(engine.config().role, Some(Role::Impolite));
    assert_eq!(engine.transfer_config().chunk_size, 1024);
}
