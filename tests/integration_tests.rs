//! Integration tests for the roulette-room pairing service
//!
//! These tests run complete engines against the in-process transports and
//! cover:
//! - Pairing, app messaging and skipping
//! - Blacklisting of unresponsive and skipped peers
//! - The propose/accept handshake as seen on the wire, including glare
//! - Sessions torn down before both links are up
//! - Channel drops and reconnection
//! - Service wiring through `AppState`

mod fixtures;

use roulette_room::channel::messages::ChannelMessage;
use roulette_room::config::{AppConfig, ChannelBackend};
use roulette_room::matchmaking::EngineNotification;
use roulette_room::service::AppState;
use roulette_room::session::{
    LinkKind, LocalMedia, SessionTransport, StaticTracks, SyntheticMediaSource,
};
use roulette_room::types::{LeaveReason, MatchStatus, Region, SessionRole};
use roulette_room::MatchmakingError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use fixtures::{
    connected_pair, next_connection, next_notification, wait_for, TestNetwork, WAIT,
};

fn is_accept(message: &ChannelMessage) -> bool {
    matches!(message, ChannelMessage::MatchAccept { .. })
}

fn is_handshake(message: &ChannelMessage) -> bool {
    matches!(
        message,
        ChannelMessage::MatchAccept { .. } | ChannelMessage::MatchPropose { .. }
    )
}

fn camera(stream_id: &str) -> LocalMedia {
    LocalMedia::new(stream_id, Arc::new(StaticTracks::default()))
}

fn partners_released(network: &TestNetwork, reason: &str) -> u64 {
    network
        .metrics
        .matching()
        .partners_released_total
        .with_label_values(&[reason])
        .get()
}

#[tokio::test(start_paused = true)]
async fn test_two_engines_pair_and_chat() {
    let network = TestNetwork::new();

    let a = network.engine("peer-a");
    let b = network.engine("peer-b");
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.start(Region::Global, Arc::new(SyntheticMediaSource::new()))
        .await
        .unwrap();
    b.start(Region::Global, Arc::new(SyntheticMediaSource::new()))
        .await
        .unwrap();

    let (a_partner, a_role, a_stream) = match next_connection(&mut a_events).await {
        EngineNotification::PartnerConnected {
            peer_id,
            role,
            stream,
        } => (peer_id, role, stream),
        other => panic!("unexpected {:?}", other),
    };
    let (b_partner, b_role) = match next_connection(&mut b_events).await {
        EngineNotification::PartnerConnected { peer_id, role, .. } => (peer_id, role),
        other => panic!("unexpected {:?}", other),
    };

    assert_eq!(a_partner, "peer-b");
    assert_eq!(b_partner, "peer-a");
    assert_ne!(a_role, b_role);
    assert_eq!(a_stream.expect("remote stream").peer_id, "peer-b");
    assert_eq!(a.status(), MatchStatus::Connected);
    assert_eq!(b.status(), MatchStatus::Connected);

    a.send_app_message("hello from a").await.unwrap();
    assert_eq!(
        next_notification(&mut b_events).await,
        EngineNotification::AppMessage {
            peer_id: "peer-a".to_string(),
            payload: "hello from a".to_string(),
        }
    );

    b.send_app_message("hi a").await.unwrap();
    assert_eq!(
        next_notification(&mut a_events).await,
        EngineNotification::AppMessage {
            peer_id: "peer-b".to_string(),
            payload: "hi a".to_string(),
        }
    );

    let matches: u64 = [SessionRole::Initiator, SessionRole::Responder]
        .iter()
        .map(|role| {
            network
                .metrics
                .matching()
                .matches_total
                .with_label_values(&[match role {
                    SessionRole::Initiator => "initiator",
                    SessionRole::Responder => "responder",
                }])
                .get()
        })
        .sum();
    assert_eq!(matches, 2);
    assert_eq!(network.metrics.matching().active_sessions.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_skip_rematches_after_release() {
    let network = TestNetwork::new();
    let (a, b) = connected_pair(&network, "peer-a", "peer-b").await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.skip(false).unwrap();

    assert_eq!(
        next_notification(&mut a_events).await,
        EngineNotification::PartnerLeft {
            peer_id: "peer-b".to_string(),
            reason: LeaveReason::Skipped,
        }
    );
    assert_eq!(
        next_notification(&mut b_events).await,
        EngineNotification::PartnerLeft {
            peer_id: "peer-a".to_string(),
            reason: LeaveReason::RemoteClosed,
        }
    );

    // Nobody was blacklisted, so the two find each other again
    next_connection(&mut a_events).await;
    next_connection(&mut b_events).await;
    assert_eq!(a.status(), MatchStatus::Connected);
    assert_eq!(b.status(), MatchStatus::Connected);
    assert!(a.send_app_message("again").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_blacklisted_partner_avoided_until_expiry() {
    let network = TestNetwork::new();
    let (a, b) = connected_pair(&network, "peer-a", "peer-b").await;

    let skipped_at = Instant::now();
    a.skip(true).unwrap();
    b.stop().await.unwrap();
    wait_for(&a, MatchStatus::Matching).await;

    // Impersonate the skipped partner once it has gone
    let mut impostor = network.observer("peer-b", Region::Global).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    impostor.publish(&ChannelMessage::presence("peer-b")).await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    impostor.publish(&ChannelMessage::presence("peer-b")).await;

    assert_eq!(
        impostor.next_matching(is_handshake).await,
        ChannelMessage::propose("peer-a", "peer-b")
    );
    assert!(skipped_at.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_partner_stop_returns_survivor_to_matching() {
    let network = TestNetwork::new();
    let (a, b) = connected_pair(&network, "peer-a", "peer-b").await;
    let mut a_events = a.subscribe();

    b.stop().await.unwrap();
    assert_eq!(b.status(), MatchStatus::Disconnected);

    match next_notification(&mut a_events).await {
        EngineNotification::PartnerLeft { peer_id, reason } => {
            assert_eq!(peer_id, "peer-b");
            assert!(matches!(
                reason,
                LeaveReason::RemoteLeft | LeaveReason::RemoteClosed
            ));
        }
        other => panic!("unexpected {:?}", other),
    }
    wait_for(&a, MatchStatus::Matching).await;

    // Stopping twice is harmless, and the stopped engine refuses work
    b.stop().await.unwrap();
    let err = b.send_app_message("anyone?").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::EngineStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_peer_times_out_and_is_skipped() {
    let network = TestNetwork::new();
    let mut ghost = network.observer("peer-0-ghost", Region::Global).await;

    let a = network.started("peer-a", Region::Global).await;
    let started = Instant::now();
    ghost.publish(&ChannelMessage::presence("peer-0-ghost")).await;
    assert_eq!(
        ghost.next_matching(is_handshake).await,
        ChannelMessage::propose("peer-a", "peer-0-ghost")
    );

    let b = network.started("peer-b", Region::Global).await;

    wait_for(&a, MatchStatus::Connected).await;
    wait_for(&b, MatchStatus::Connected).await;
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert_eq!(network.metrics.matching().handshake_timeouts_total.get(), 1);
    assert_eq!(
        network
            .metrics
            .matching()
            .partners_released_total
            .with_label_values(&["handshake_timeout"])
            .get(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_single_accept_per_proposal() {
    let network = TestNetwork::new();
    let mut proposer = network.observer("peer-a", Region::Global).await;
    let intruder = network.observer("peer-c", Region::Global).await;
    let _b = network.started("peer-b", Region::Global).await;

    proposer
        .publish(&ChannelMessage::propose("peer-a", "peer-b"))
        .await;
    assert_eq!(
        proposer.next_matching(is_accept).await,
        ChannelMessage::accept("peer-b", "peer-a")
    );

    // A repeated proposal gets exactly one more accept
    proposer
        .publish(&ChannelMessage::propose("peer-a", "peer-b"))
        .await;
    assert_eq!(
        proposer.next_matching(is_accept).await,
        ChannelMessage::accept("peer-b", "peer-a")
    );

    // A third party cannot steal the lock; the next accept still targets peer-a
    intruder
        .publish(&ChannelMessage::propose("peer-c", "peer-b"))
        .await;
    proposer
        .publish(&ChannelMessage::propose("peer-a", "peer-b"))
        .await;
    assert_eq!(
        proposer.next_matching(is_accept).await,
        ChannelMessage::accept("peer-b", "peer-a")
    );
}

#[tokio::test(start_paused = true)]
async fn test_glare_lower_id_initiates() {
    let network = TestNetwork::new();
    let mut rival = network.observer("peer-a", Region::Global).await;
    let _b = network.started("peer-b", Region::Global).await;

    rival.publish(&ChannelMessage::presence("peer-a")).await;
    assert_eq!(
        rival.next_matching(is_handshake).await,
        ChannelMessage::propose("peer-b", "peer-a")
    );

    // Both proposed; peer-a has the lower id, so peer-b yields and accepts
    rival
        .publish(&ChannelMessage::propose("peer-a", "peer-b"))
        .await;
    assert_eq!(
        rival.next_matching(is_accept).await,
        ChannelMessage::accept("peer-b", "peer-a")
    );
}

#[tokio::test(start_paused = true)]
async fn test_glare_higher_id_keeps_proposal() {
    let network = TestNetwork::new();
    let mut rival = network.observer("peer-c", Region::Global).await;
    let _b = network.started("peer-b", Region::Global).await;

    rival.publish(&ChannelMessage::presence("peer-c")).await;
    assert_eq!(
        rival.next_matching(is_handshake).await,
        ChannelMessage::propose("peer-b", "peer-c")
    );

    // peer-b has the lower id and keeps proposing instead of accepting
    rival
        .publish(&ChannelMessage::propose("peer-c", "peer-b"))
        .await;
    assert_eq!(
        rival.next_matching(is_handshake).await,
        ChannelMessage::propose("peer-b", "peer-c")
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropped_channel_reconnects_and_reannounces() {
    let network = TestNetwork::new();
    let mut watcher = network.observer("watcher", Region::Global).await;
    let a = network.started("peer-a", Region::Global).await;
    assert_eq!(
        watcher.next_message().await,
        ChannelMessage::presence("peer-a")
    );

    let dropped_at = Instant::now();
    assert!(network.broadcast.sever(Region::Global, "peer-a"));
    wait_for(&a, MatchStatus::ChannelOffline).await;

    assert_eq!(
        watcher.next_message().await,
        ChannelMessage::presence("peer-a")
    );
    assert!(dropped_at.elapsed() >= Duration::from_secs(3));
    assert_eq!(a.status(), MatchStatus::Matching);
    assert_eq!(network.metrics.channel().reconnects_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partner_close_during_negotiation_is_clean() {
    let network = TestNetwork::new();
    let mut caller = network.observer("peer-a", Region::Global).await;
    let (caller_session, _caller_requests) = network.sessions.endpoint("peer-a").unwrap();
    let b = network.started("peer-b", Region::Global).await;

    caller
        .publish(&ChannelMessage::propose("peer-a", "peer-b"))
        .await;
    assert_eq!(
        caller.next_matching(is_accept).await,
        ChannelMessage::accept("peer-b", "peer-a")
    );

    // Only the media half of the session ever arrives
    let opening = tokio::spawn(async move {
        let link = caller_session
            .open(&"peer-b".to_string(), LinkKind::Media, &camera("peer-a-cam"))
            .await;
        (caller_session, link)
    });
    wait_for(&b, MatchStatus::Negotiating).await;
    let (_caller_session, link) = opening.await.unwrap();
    let link = link.unwrap();

    let closed_at = Instant::now();
    link.control.close().await;
    wait_for(&b, MatchStatus::Matching).await;
    assert!(closed_at.elapsed() < Duration::from_secs(6));
    assert_eq!(partners_released(&network, "remote_closed"), 1);
    assert_eq!(partners_released(&network, "handshake_timeout"), 0);

    caller.drain();
    caller.publish(&ChannelMessage::presence("peer-a")).await;
    assert_eq!(
        caller.next_matching(is_handshake).await,
        ChannelMessage::propose("peer-b", "peer-a")
    );
}

#[tokio::test(start_paused = true)]
async fn test_refused_data_link_blacklists_partner() {
    let network = TestNetwork::new();
    let mut callee = network.observer("peer-b", Region::Global).await;
    let (callee_session, mut callee_requests) = network.sessions.endpoint("peer-b").unwrap();
    let a = network.started("peer-a", Region::Global).await;

    callee.publish(&ChannelMessage::presence("peer-b")).await;
    assert_eq!(
        callee.next_matching(is_handshake).await,
        ChannelMessage::propose("peer-a", "peer-b")
    );
    callee
        .publish(&ChannelMessage::accept("peer-b", "peer-a"))
        .await;
    wait_for(&a, MatchStatus::Negotiating).await;

    // Answer the media link, refuse the data link
    let mut media_link = None;
    for _ in 0..2 {
        let request = tokio::time::timeout(WAIT, callee_requests.recv())
            .await
            .expect("Timed out waiting for a session request")
            .expect("Session requests closed");
        match request.kind {
            LinkKind::Media => {
                media_link = callee_session
                    .answer(&request, &camera("peer-b-cam"))
                    .await
                    .ok();
            }
            LinkKind::Data => callee_session.reject(&request).await,
        }
    }

    wait_for(&a, MatchStatus::Matching).await;
    assert_eq!(partners_released(&network, "session_error"), 1);

    callee.drain();
    callee.publish(&ChannelMessage::presence("peer-b")).await;
    let proposal =
        tokio::time::timeout(Duration::from_secs(10), callee.next_matching(is_handshake)).await;
    assert!(proposal.is_err(), "proposed to a blacklisted partner");
    drop(media_link);
}

#[tokio::test(start_paused = true)]
async fn test_media_unavailable_is_fatal() {
    let network = TestNetwork::new();
    let engine = network.engine("peer-a");

    let err = engine
        .start(Region::Global, Arc::new(SyntheticMediaSource::unavailable()))
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::MediaUnavailable { .. })
    ));
    assert_eq!(engine.status(), MatchStatus::FatalError);
    assert_eq!(network.broadcast.member_count(Region::Global), 0);
}

#[tokio::test(start_paused = true)]
async fn test_regions_are_isolated() {
    let network = TestNetwork::new();
    let a = network.started("peer-a", Region::Europe).await;
    let b = network.started("peer-b", Region::Asia).await;

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(a.status(), MatchStatus::Matching);
    assert_eq!(b.status(), MatchStatus::Matching);
    assert_eq!(network.broadcast.member_count(Region::Europe), 1);
    assert_eq!(network.broadcast.member_count(Region::Asia), 1);

    let stopped = futures::future::join_all([a.stop(), b.stop()]).await;
    assert!(stopped.iter().all(|result| result.is_ok()));
    assert_eq!(network.broadcast.member_count(Region::Europe), 0);
    assert_eq!(network.broadcast.member_count(Region::Asia), 0);
}

#[tokio::test(start_paused = true)]
async fn test_app_state_pairs_local_peers() {
    let mut config = AppConfig::default();
    config.channel.backend = ChannelBackend::Local;
    config.service.enable_health_server = false;
    config.service.local_peers = 2;

    let state = Arc::new(AppState::new(config).await.unwrap());
    state.start().await.unwrap();

    for engine in state.engines() {
        wait_for(engine, MatchStatus::Connected).await;
    }
    assert_eq!(state.metrics_collector().matching().active_sessions.get(), 2);

    state.shutdown().await.unwrap();
    for engine in state.engines() {
        assert_eq!(engine.status(), MatchStatus::Disconnected);
    }
}
