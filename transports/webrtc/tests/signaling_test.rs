//! Offer / answer / trickle-ICE flows over the in-memory engine

#![cfg(unix)]

mod harness;

use harness::{candidate, test_source, BridgeHarness, FakeFfmpeg};
use remotemedia_ffmpeg_webrtc::signaling::{
    IceCandidate, RtcConfiguration, SdpType, SessionDescription, SignalingMessage,
};
use remotemedia_ffmpeg_webrtc::{Error, IceServerConfig};
use std::time::Duration;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

fn answer(id: &str, candidates: Vec<IceCandidate>) -> SignalingMessage {
    SignalingMessage {
        id: Some(id.to_string()),
        description: Some(SessionDescription::answer("v=0\r\ns=remote\r\n")),
        candidates: Some(candidates),
        configuration: None,
    }
}

fn trickle(id: &str, candidates: Vec<IceCandidate>) -> SignalingMessage {
    SignalingMessage::trickle(id.to_string(), candidates)
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let first = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first.clone());
            out.push(tail);
        }
    }
    out
}

#[tokio::test]
async fn test_offer_message_shape() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);

    let offer = harness.handler.create_offer(&test_source()).await.unwrap();
    let id = offer.id.clone().unwrap();
    assert!(uuid_like(&id));
    assert_eq!(offer.candidates, Some(vec![]));
    assert_eq!(offer.description.as_ref().unwrap().sdp_type, SdpType::Offer);

    let configuration = offer.configuration.clone().unwrap();
    assert_eq!(configuration.ice_servers, harness.handler.config().ice_servers);
    assert_eq!(harness.connection().ice_servers(), configuration.ice_servers.as_slice());

    assert_eq!(harness.handler.session_count().await, 1);
    let json = offer.to_json().unwrap();
    assert!(json.contains("\"candidates\":[]"));
    assert!(json.contains("\"iceServers\""));

    // The transcoder's stream lines carry both formats
    let session = harness.handler.sessions().get(&id).await.unwrap();
    let probe = session.media().probe();
    let resolution = probe.wait_resolution(STEP).await.unwrap();
    assert_eq!((resolution.width, resolution.height), (16, 16));
    let format = probe.wait_sample_format(STEP).await.unwrap();
    assert_eq!((format.sample_rate, format.channels), (48_000, 2));
    assert!(probe.is_resolved());

    harness.handler.close_session(&id).await.unwrap();
    assert_eq!(harness.handler.session_count().await, 0);
}

fn uuid_like(id: &str) -> bool {
    id.len() == 36 && id.chars().filter(|c| *c == '-').count() == 4
}

#[tokio::test]
async fn test_candidates_before_answer_are_buffered() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);
    let offer = harness.handler.create_offer(&test_source()).await.unwrap();
    let id = offer.id.unwrap();
    let connection = harness.connection();
    let session = harness.handler.sessions().get(&id).await.unwrap();
    assert_eq!(Some(session.configuration()), offer.configuration.as_ref());

    // No description yet: returns at once, nothing applied
    let response = timeout(
        STEP,
        harness
            .handler
            .apply_answer(&trickle(&id, vec![candidate(1), candidate(2)])),
    )
    .await
    .expect("candidate-only message must not block")
    .unwrap();
    assert_eq!(response.id.as_deref(), Some(id.as_str()));
    assert_eq!(response.candidates, Some(vec![]));
    assert!(response.description.is_none());
    assert!(response.configuration.is_none());
    assert!(connection.applied_candidates().is_empty());
    assert_eq!(session.pending_remote_candidates().await, 2);

    timeout(STEP, harness.handler.apply_answer(&answer(&id, vec![candidate(3)])))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        connection.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );
    assert_eq!(session.pending_remote_candidates().await, 0);
    assert_eq!(connection.remote_description_count(), 1);

    timeout(STEP, harness.handler.apply_answer(&trickle(&id, vec![candidate(4)])))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.applied_candidates().len(), 4);
    assert_eq!(connection.remote_description_count(), 1);

    harness.handler.close_all().await;
}

#[tokio::test]
async fn test_any_message_order_applies_every_candidate() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);

    #[derive(Clone)]
    enum Step {
        Answer(Vec<u32>),
        Trickle(Vec<u32>),
    }

    let steps = vec![
        Step::Trickle(vec![1]),
        Step::Trickle(vec![2, 3]),
        Step::Answer(vec![4]),
        Step::Trickle(vec![5]),
    ];

    for order in permutations(&steps) {
        let offer = harness.handler.create_offer(&test_source()).await.unwrap();
        let id = offer.id.unwrap();
        let connection = harness.connection();

        let mut sent = Vec::new();
        for step in &order {
            let message = match step {
                Step::Answer(ns) => answer(&id, ns.iter().copied().map(candidate).collect()),
                Step::Trickle(ns) => trickle(&id, ns.iter().copied().map(candidate).collect()),
            };
            sent.extend(message.candidate_list().iter().cloned());
            // Every message here carries candidates, so none may block
            timeout(STEP, harness.handler.apply_answer(&message))
                .await
                .expect("apply_answer blocked")
                .unwrap();
        }

        let mut applied = connection.applied_candidates();
        let mut expected = sent.clone();
        applied.sort_by(|a, b| a.candidate.cmp(&b.candidate));
        expected.sort_by(|a, b| a.candidate.cmp(&b.candidate));
        assert_eq!(applied, expected);
        assert_eq!(connection.remote_description_count(), 1);

        harness.handler.close_session(&id).await.unwrap();
    }

    assert_eq!(harness.handler.session_count().await, 0);
}

#[tokio::test]
async fn test_local_candidates_drained_exactly_once() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);
    let offer = harness.handler.create_offer(&test_source()).await.unwrap();
    let id = offer.id.unwrap();
    let connection = harness.connection();

    connection.emit_local_candidate(candidate(1));
    connection.emit_local_candidate(candidate(2));
    connection.emit_local_candidate(candidate(3));

    let first = timeout(STEP, harness.handler.apply_answer(&answer(&id, vec![])))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        first.candidates,
        Some(vec![candidate(1), candidate(2), candidate(3)])
    );

    // Applies a remote candidate, so it returns without waiting
    let second = timeout(STEP, harness.handler.apply_answer(&trickle(&id, vec![candidate(9)])))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.candidates, Some(vec![]));

    connection.emit_local_candidate(candidate(4));
    let third = timeout(STEP, harness.handler.apply_answer(&trickle(&id, vec![])))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.candidates, Some(vec![candidate(4)]));

    harness.handler.close_all().await;
}

#[tokio::test]
async fn test_concurrent_waiters_all_wake() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);
    let offer = harness.handler.create_offer(&test_source()).await.unwrap();
    let id = offer.id.unwrap();
    let connection = harness.connection();

    timeout(STEP, harness.handler.apply_answer(&answer(&id, vec![candidate(1)])))
        .await
        .unwrap()
        .unwrap();

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let handler = harness.handler.clone();
        let message = trickle(&id, vec![]);
        waiters.push(tokio::spawn(async move { handler.apply_answer(&message).await }));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    connection.emit_local_candidate(candidate(7));
    connection.complete_gathering();

    let mut received = Vec::new();
    for waiter in waiters {
        let response = timeout(STEP, waiter).await.expect("waiter hung").unwrap().unwrap();
        received.extend(response.candidates.unwrap());
    }
    assert_eq!(received, vec![candidate(7)]);
    assert_eq!(connection.applied_candidates(), vec![candidate(1)]);

    harness.handler.close_all().await;
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);

    let result = harness
        .handler
        .apply_answer(&trickle("00000000-0000-4000-8000-000000000000", vec![]))
        .await;
    assert!(matches!(result, Err(Error::SessionNotFound(_))));

    let mut no_id = trickle("x", vec![candidate(1)]);
    no_id.id = None;
    let result = harness.handler.apply_answer(&no_id).await;
    assert!(matches!(result, Err(Error::SessionNotFound(_))));

    assert!(matches!(
        harness.handler.close_session("missing").await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_waiting_answer_ends_on_close() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);
    let offer = harness.handler.create_offer(&test_source()).await.unwrap();
    let id = offer.id.unwrap();

    let waiter = {
        let handler = harness.handler.clone();
        let message = answer(&id, vec![]);
        tokio::spawn(async move { handler.apply_answer(&message).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    harness.handler.close_session(&id).await.unwrap();
    let result = timeout(STEP, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::SessionClosed(_))));

    let result = harness.handler.apply_answer(&trickle(&id, vec![])).await;
    assert!(matches!(result, Err(Error::SessionNotFound(_))));
}

#[tokio::test]
async fn test_answer_to_remote_offer() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);
    let custom = RtcConfiguration::new(vec![IceServerConfig::stun("stun:stun.example.org:3478")]);
    let offer = SignalingMessage {
        id: None,
        description: Some(SessionDescription::offer("v=0\r\ns=browser\r\n")),
        candidates: Some(vec![candidate(1)]),
        configuration: Some(custom.clone()),
    };

    let pending = {
        let handler = harness.handler.clone();
        let offer = offer.clone();
        tokio::spawn(async move { handler.create_answer(&offer, &test_source()).await })
    };

    let connection = timeout(STEP, async {
        loop {
            if let Some(connection) = harness.engine.last_connection() {
                if connection.remote_description_count() == 1 {
                    return connection;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("remote offer never applied");

    connection.emit_local_candidate(candidate(5));
    connection.complete_gathering();

    let answered = timeout(STEP, pending).await.unwrap().unwrap().unwrap();
    let description = answered.message.description.as_ref().unwrap();
    assert_eq!(description.sdp_type, SdpType::Answer);
    assert!(description.sdp.contains(&candidate(5).candidate));
    assert!(answered.message.candidates.is_none());
    let json = answered.message.to_json().unwrap();
    assert!(!json.contains("\"candidates\""));
    assert_eq!(answered.message.configuration, Some(custom.clone()));
    assert_eq!(answered.message.id.as_deref(), Some(answered.session_id.as_str()));

    assert_eq!(connection.ice_servers(), custom.ice_servers.as_slice());
    assert_eq!(connection.applied_candidates(), vec![candidate(1)]);
    assert_eq!(harness.handler.session_count().await, 1);

    harness.handler.close_session(&answered.session_id).await.unwrap();
}

#[tokio::test]
async fn test_answer_ends_when_closed_while_gathering() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);
    let offer = SignalingMessage {
        id: None,
        description: Some(SessionDescription::offer("v=0\r\ns=browser\r\n")),
        candidates: None,
        configuration: None,
    };

    let pending = {
        let handler = harness.handler.clone();
        tokio::spawn(async move { handler.create_answer(&offer, &test_source()).await })
    };

    // Registered and waiting for the end of gathering
    let id = timeout(STEP, async {
        loop {
            if let Some(id) = harness.handler.sessions().session_ids().await.pop() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("answering session never registered");
    assert!(!pending.is_finished());

    harness.handler.close_session(&id).await.unwrap();
    let result = timeout(STEP, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::SessionClosed(ref closed)) if *closed == id));
    assert_eq!(harness.handler.session_count().await, 0);
    assert_eq!(harness.connection().close_count(), 1);
}

#[tokio::test]
async fn test_answer_requires_offer_description() {
    let harness = BridgeHarness::new(FakeFfmpeg::LongRunning);

    let not_an_offer = answer("ignored", vec![]);
    let result = harness.handler.create_answer(&not_an_offer, &test_source()).await;
    assert!(matches!(result, Err(Error::SdpError(_))));

    let empty = SignalingMessage::default();
    let result = harness.handler.create_answer(&empty, &test_source()).await;
    assert!(matches!(result, Err(Error::SdpError(_))));

    assert!(harness.engine.connections().is_empty());
    assert_eq!(harness.handler.session_count().await, 0);
}
