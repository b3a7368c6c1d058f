//! End-to-end call scenarios over the loopback router
//!
//! Two full clients, an in-process server, deterministic engines and
//! fake media. Every scenario asserts the resource invariant: no path
//! out of a call leaves a live track behind.

#![allow(clippy::unwrap_used)]

use souk_rtc_core::cache::{CacheConfig, MessageCache};
use souk_rtc_core::client::{RtcClient, RtcConfig};
use souk_rtc_core::loopback::{FakeMediaSource, LoopbackEngineFactory, LoopbackRouter};
use souk_rtc_core::types::{CallState, MediaKind, Profile};
use souk_rtc_core::{CallError, CallEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

struct TestClient {
    profile: Profile,
    client: RtcClient,
    media: Arc<FakeMediaSource>,
    engines: Arc<LoopbackEngineFactory>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn spawn_client(router: &Arc<LoopbackRouter>, id: &str, config: RtcConfig) -> TestClient {
    init_tracing();
    let profile = Profile::new(id, id);
    let media = Arc::new(FakeMediaSource::new());
    let engines = Arc::new(LoopbackEngineFactory::new());
    let client = RtcClient::new(
        profile.user_id.clone(),
        router.wire_for(profile.clone()),
        router.api_for(profile.user_id.clone()),
        Arc::new(MessageCache::open_in_memory(CacheConfig::default()).unwrap()),
        media.clone(),
        engines.clone(),
        config,
    );
    client.start();
    let mut connected = client.channel().watch_connected();
    connected.wait_for(|up| *up).await.unwrap();
    TestClient {
        profile,
        client,
        media,
        engines,
    }
}

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_event<F>(events: &mut tokio::sync::broadcast::Receiver<CallEvent>, matches: F)
where
    F: Fn(&CallEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return;
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn audio_call_accept_then_hangup_releases_everything() {
    let router = Arc::new(LoopbackRouter::new());
    let alice = spawn_client(&router, "alice", RtcConfig::default()).await;
    let bob = spawn_client(&router, "bob", RtcConfig::default()).await;

    let mut alice_events = alice.client.calls().subscribe_events();
    let mut bob_events = bob.client.calls().subscribe_events();

    let call_id = alice
        .client
        .calls()
        .start_call(bob.profile.clone(), MediaKind::Audio)
        .await
        .unwrap();

    wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::IncomingCall { call_id: id, .. } if *id == call_id)
    })
    .await;
    // Ringing never touches the callee's devices.
    assert_eq!(bob.media.acquired_count(), 0);

    bob.client.calls().accept().await.unwrap();
    wait_for_event(&mut alice_events, |e| {
        matches!(
            e,
            CallEvent::StateChanged {
                state: CallState::Active,
                ..
            }
        )
    })
    .await;
    assert_eq!(bob.client.calls().state().await, CallState::Active);
    // Tracks went in before the offer and answer were produced.
    assert!(alice.engines.engines().iter().all(|e| e.tracks_attached()));
    assert!(bob.engines.engines().iter().all(|e| e.tracks_attached()));

    // Candidates crossed: each engine applied the other's.
    eventually("candidates exchanged", || async {
        alice.engines.engines().iter().any(|e| !e.applied_candidates().is_empty())
            && bob.engines.engines().iter().any(|e| !e.applied_candidates().is_empty())
    })
    .await;

    alice.client.calls().hang_up().await.unwrap();
    wait_for_event(&mut bob_events, |e| {
        matches!(
            e,
            CallEvent::Ended {
                state: CallState::Ended,
                ..
            }
        )
    })
    .await;

    eventually("all resources released", || async {
        alice.client.calls().current().await.is_none()
            && bob.client.calls().current().await.is_none()
            && alice.media.all_streams_stopped()
            && bob.media.all_streams_stopped()
            && alice.engines.engines().iter().all(|e| e.is_closed())
            && bob.engines.engines().iter().all(|e| e.is_closed())
    })
    .await;
}

#[tokio::test]
async fn rejected_call_ends_cleanly_on_both_sides() {
    let router = Arc::new(LoopbackRouter::new());
    let alice = spawn_client(&router, "alice", RtcConfig::default()).await;
    let bob = spawn_client(&router, "bob", RtcConfig::default()).await;

    let mut alice_events = alice.client.calls().subscribe_events();
    let mut bob_events = bob.client.calls().subscribe_events();

    alice
        .client
        .calls()
        .start_call(bob.profile.clone(), MediaKind::Video)
        .await
        .unwrap();
    wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;

    bob.client.calls().reject().await.unwrap();
    wait_for_event(&mut alice_events, |e| {
        matches!(
            e,
            CallEvent::Ended {
                state: CallState::Ended,
                ..
            }
        )
    })
    .await;

    assert_eq!(bob.media.acquired_count(), 0);
    eventually("caller media released", || async {
        alice.media.all_streams_stopped() && alice.client.calls().current().await.is_none()
    })
    .await;
    assert!(bob.client.calls().current().await.is_none());
}

#[tokio::test]
async fn unanswered_call_times_out_on_both_sides() {
    let router = Arc::new(LoopbackRouter::new());
    let mut config = RtcConfig::default();
    config.call.ring_timeout = Duration::from_millis(150);
    let alice = spawn_client(&router, "alice", config).await;
    let bob = spawn_client(&router, "bob", RtcConfig::default()).await;

    let mut alice_events = alice.client.calls().subscribe_events();
    let mut bob_events = bob.client.calls().subscribe_events();

    alice
        .client
        .calls()
        .start_call(bob.profile.clone(), MediaKind::Audio)
        .await
        .unwrap();
    wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;

    // Nobody answers; the caller's timer fires and the end propagates.
    wait_for_event(&mut alice_events, |e| {
        matches!(
            e,
            CallEvent::Ended {
                state: CallState::Ended,
                ..
            }
        )
    })
    .await;
    wait_for_event(&mut bob_events, |e| {
        matches!(
            e,
            CallEvent::Ended {
                state: CallState::Ended,
                ..
            }
        )
    })
    .await;

    assert_eq!(bob.media.acquired_count(), 0);
    eventually("both sides idle", || async {
        alice.client.calls().current().await.is_none()
            && bob.client.calls().current().await.is_none()
            && alice.media.all_streams_stopped()
    })
    .await;
}

#[tokio::test]
async fn answer_near_ring_expiry_keeps_the_call_alive() {
    let router = Arc::new(LoopbackRouter::new());
    let mut config = RtcConfig::default();
    config.call.ring_timeout = Duration::from_millis(200);
    let alice = spawn_client(&router, "alice", config.clone()).await;
    let bob = spawn_client(&router, "bob", config).await;

    let mut alice_events = alice.client.calls().subscribe_events();
    let mut bob_events = bob.client.calls().subscribe_events();

    alice
        .client
        .calls()
        .start_call(bob.profile.clone(), MediaKind::Audio)
        .await
        .unwrap();
    wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;

    // Answer with the ring window nearly spent on both sides.
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.client.calls().accept().await.unwrap();
    wait_for_event(&mut alice_events, |e| {
        matches!(
            e,
            CallEvent::StateChanged {
                state: CallState::Active,
                ..
            }
        )
    })
    .await;

    // Outlive the original ring window. A timer that fires after the
    // call left `Ringing` must be ignored, not end the call.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(alice.client.calls().state().await, CallState::Active);
    assert_eq!(bob.client.calls().state().await, CallState::Active);
    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, CallEvent::Ended { .. }));
    }
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, CallEvent::Ended { .. }));
    }
}

#[tokio::test]
async fn simultaneous_calls_leave_no_dangling_state() {
    let router = Arc::new(LoopbackRouter::new());
    // Short ring timeout so any interleaving that leaves one side
    // ringing still settles within the assertion window.
    let mut config = RtcConfig::default();
    config.call.ring_timeout = Duration::from_millis(200);
    let alice = spawn_client(&router, "alice", config.clone()).await;
    let bob = spawn_client(&router, "bob", config).await;

    // Offer glare: both sides place a call before seeing the other's.
    let (a, b) = tokio::join!(
        alice
            .client
            .calls()
            .start_call(bob.profile.clone(), MediaKind::Audio),
        bob.client
            .calls()
            .start_call(alice.profile.clone(), MediaKind::Audio),
    );
    // Each attempt either rang or was superseded by the crossing offer.
    for result in [a, b] {
        match result {
            Ok(_) | Err(CallError::Superseded) => {}
            Err(other) => panic!("unexpected glare outcome: {other}"),
        }
    }

    // However the offers and ends interleave, the system settles with
    // at most one live call per side and no live tracks outside it.
    eventually("glare settles", || async {
        let alice_live = alice
            .client
            .calls()
            .current()
            .await
            .is_some_and(|c| c.state.is_live());
        let bob_live = bob
            .client
            .calls()
            .current()
            .await
            .is_some_and(|c| c.state.is_live());
        if alice_live || bob_live {
            return false;
        }
        alice.media.all_streams_stopped() && bob.media.all_streams_stopped()
    })
    .await;
}

#[tokio::test]
async fn callee_media_denial_declines_the_call() {
    let router = Arc::new(LoopbackRouter::new());
    let alice = spawn_client(&router, "alice", RtcConfig::default()).await;
    let bob = spawn_client(&router, "bob", RtcConfig::default()).await;
    bob.media.set_deny(true);

    let mut alice_events = alice.client.calls().subscribe_events();
    let mut bob_events = bob.client.calls().subscribe_events();

    alice
        .client
        .calls()
        .start_call(bob.profile.clone(), MediaKind::Video)
        .await
        .unwrap();
    wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;

    let denied = bob.client.calls().accept().await;
    assert!(denied.is_err());

    // The caller is not left ringing forever.
    wait_for_event(&mut alice_events, |e| matches!(e, CallEvent::Ended { .. })).await;
    assert!(bob.client.calls().current().await.is_none());
    eventually("caller released", || async {
        alice.media.all_streams_stopped()
    })
    .await;
}

#[tokio::test]
async fn negotiation_failure_fails_the_call_without_leaks() {
    let router = Arc::new(LoopbackRouter::new());
    let alice = spawn_client(&router, "alice", RtcConfig::default()).await;
    let bob = spawn_client(&router, "bob", RtcConfig::default()).await;
    alice.engines.set_fail_negotiation(true);

    let result = alice
        .client
        .calls()
        .start_call(bob.profile.clone(), MediaKind::Audio)
        .await;
    assert!(result.is_err());

    assert!(alice.client.calls().current().await.is_none());
    assert!(alice.media.all_streams_stopped());
}

#[tokio::test]
async fn second_call_supersedes_the_first() {
    let router = Arc::new(LoopbackRouter::new());
    let alice = spawn_client(&router, "alice", RtcConfig::default()).await;
    let bob = spawn_client(&router, "bob", RtcConfig::default()).await;
    let carol = spawn_client(&router, "carol", RtcConfig::default()).await;

    let mut bob_events = bob.client.calls().subscribe_events();

    let first = alice
        .client
        .calls()
        .start_call(bob.profile.clone(), MediaKind::Audio)
        .await
        .unwrap();
    wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::IncomingCall { call_id, .. } if *call_id == first)
    })
    .await;

    let second = alice
        .client
        .calls()
        .start_call(carol.profile.clone(), MediaKind::Audio)
        .await
        .unwrap();
    assert_ne!(first, second);

    // Bob's ring is cancelled by the superseding end.
    wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::Ended { call_id, .. } if *call_id == first)
    })
    .await;

    let current = alice.client.calls().current().await.unwrap();
    assert_eq!(current.id, second);
    assert_eq!(current.state, CallState::Ringing);
    assert_eq!(current.counterparty.user_id, carol.profile.user_id);
}
