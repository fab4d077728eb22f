mod common;

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use common::*;
use tutorcall_lib::api::server::spawn_relay;
use tutorcall_lib::config::SessionConfig;
use tutorcall_lib::events::{ChannelObserver, SessionEvent};
use tutorcall_lib::media::synthetic::SyntheticDevices;
use tutorcall_lib::media::{MediaError, TrackKind};
use tutorcall_lib::session::{SessionCoordinator, SessionDeps, SessionState};
use tutorcall_lib::signaling::UserId;
use tutorcall_lib::state::RelayContext;
use tutorcall_lib::transport::WsConnector;

struct Participant {
    coordinator: SessionCoordinator,
    factory: Arc<MockPeerFactory>,
    devices: SyntheticDevices,
    events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
}

async fn join(base_url: &str, session: &str, user_id: UserId, name: &str, devices: SyntheticDevices) -> Participant {
    let factory = MockPeerFactory::new();
    let deps = SessionDeps {
        connector: Arc::new(WsConnector::new(base_url)),
        peers: factory.clone(),
        media: Arc::new(devices.clone()),
    };
    let coordinator = SessionCoordinator::new(SessionConfig::default(), deps);
    let (observer, events) = ChannelObserver::new();
    coordinator.set_callbacks(observer);
    coordinator
        .initialize(session, user_id, &format!("{}:{}", user_id, name))
        .await
        .expect("initialize");
    Participant {
        coordinator,
        factory,
        devices,
        events,
    }
}

#[tokio::test]
async fn video_enabled_by_one_participant_reaches_the_other() {
    let ctx = RelayContext::new();
    let addr = spawn_relay(ctx.clone(), "127.0.0.1:0").await.unwrap();
    let base = format!("ws://{}", addr);

    let alice_devices = SyntheticDevices::new();
    alice_devices.fail_next(MediaError::PermissionDenied);
    let alice = join(&base, "room-7", 1, "Alice", alice_devices).await;
    wait_until_async(|| {
        let ctx = ctx.clone();
        async move { ctx.roster("room-7").await.len() == 1 }
    })
    .await;

    let mut bob = join(&base, "room-7", 2, "Bob", SyntheticDevices::new()).await;

    // Alice hears about Bob and connects to him.
    let mut peers = alice.coordinator.subscribe_state();
    tokio::time::timeout(WAIT, peers.wait_for(|s| s.peers == [2]))
        .await
        .expect("alice never registered bob")
        .unwrap();
    wait_until(|| bob.coordinator.peer_ids() == vec![1]).await;
    assert!(!alice.coordinator.is_video_enabled());

    assert!(alice.coordinator.toggle_video(true).await.unwrap());

    let received = next_event(&mut bob.events, |e| {
        matches!(e, SessionEvent::StreamReceived { user_id: 1, stream } if stream.has_kind(TrackKind::Video))
    })
    .await;
    let SessionEvent::StreamReceived { stream, .. } = received else {
        unreachable!()
    };
    assert!(stream.has_kind(TrackKind::Video));
    assert_eq!(alice.factory.created(), 1);
    assert_eq!(bob.factory.created(), 1);
    assert_eq!(alice.devices.live_hardware_tracks(), 1);

    let roster = ctx.roster("room-7").await;
    let names: Vec<&str> = roster.iter().map(|p| p.user_name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
}

#[tokio::test]
async fn server_closing_the_socket_tears_the_session_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A room server that introduces one participant, waits for our offer, then hangs up.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let auth = ws.next().await.unwrap().unwrap();
        assert!(auth.to_text().unwrap().contains("\"auth\""));
        ws.send(Message::Text(
            r#"{"type":"user_joined","user_id":2,"user_name":"Bo"}"#.to_string(),
        ))
        .await
        .unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.to_text().map(|t| t.contains("webrtc_signal")).unwrap_or(false) {
                break;
            }
        }
        ws.close(None).await.unwrap();
    });

    let mut alice = join(&format!("ws://{}", addr), "room-9", 1, "Alice", SyntheticDevices::new()).await;
    assert_eq!(alice.devices.live_hardware_tracks(), 2);

    next_event(&mut alice.events, |e| matches!(e, SessionEvent::Closed { .. })).await;
    server.await.unwrap();

    assert_eq!(alice.coordinator.state(), SessionState::Closed);
    assert!(alice.coordinator.current_local_stream().await.is_none());
    assert!(alice.coordinator.peer_ids().is_empty());
    assert_eq!(alice.devices.live_hardware_tracks(), 0);
    assert!(alice.factory.link(2).is_closed());
}

async fn wait_until_async<F, Fut>(cond: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !cond().await {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
