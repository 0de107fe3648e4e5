//! End-to-end tests of the game lifecycle against a real server:
//! matching, validation, signaling relay, episodes and ending paths.

mod common;

use std::time::Duration;

use common::{TestClient, matched_pair, playing_pair, spawn_test_server};
use mug_proto::messages::keepalive::{Ping, Pong};
use mug_proto::messages::matchmaking::{
    CancelMatch, EpisodeComplete, GameMatched, GameStarted, PlayerExcluded, WaitingForMatch,
};
use mug_proto::messages::reconnect::{GameEndReason, GameEnded};
use mug_proto::messages::session::{ErrorCode, ErrorMsg};
use mug_proto::messages::signaling::{RelayedSignal, Signal, SignalPayload};
use mug_server::{SceneConfig, ServerConfig};

fn config(num_episodes: u32) -> ServerConfig {
    ServerConfig {
        default_scene: SceneConfig {
            num_episodes,
            ..SceneConfig::default()
        },
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn pair_is_matched_validated_and_completes() -> anyhow::Result<()> {
    let addr = spawn_test_server(config(2)).await;
    let ((mut a, ma), (mut b, mb)) = matched_pair(addr, "complete").await?;

    assert_eq!(ma.game_id, mb.game_id);
    assert_eq!(ma.players, vec!["complete-a".to_string(), "complete-b".to_string()]);
    assert_eq!((ma.player_index, mb.player_index), (0, 1));
    assert!(ma.initiator && !mb.initiator);
    assert_eq!(ma.seed, mb.seed);
    assert_eq!(ma.validation_attempt, 1);
    assert_eq!(ma.num_episodes, 2);

    // Signaling flows while validating.
    a.send(&Signal {
        game_id: ma.game_id.clone(),
        payload: SignalPayload::Offer {
            sdp: "v=0".into(),
            ice_restart: false,
            generation: 0,
        },
    })
    .await?;
    let relayed = b.recv::<RelayedSignal>().await?;
    assert_eq!(relayed.from_player, "complete-a");

    a.validate(&ma, true).await?;
    assert!(b.quiet::<GameStarted>(Duration::from_millis(100)).await?);
    b.validate(&mb, true).await?;
    a.recv::<GameStarted>().await?;
    b.recv::<GameStarted>().await?;

    for episode in 1..=2 {
        for c in [&mut a, &mut b] {
            c.send(&EpisodeComplete {
                game_id: ma.game_id.clone(),
                episode,
                frame_number: episode * 600,
            })
            .await?;
        }
    }
    let end_a = a.recv::<GameEnded>().await?;
    let end_b = b.recv::<GameEnded>().await?;
    assert_eq!(end_a.reason, GameEndReason::Completed);
    assert_eq!(end_b.reason, GameEndReason::Completed);

    // The game is gone; its id is no longer accepted.
    a.send(&EpisodeComplete {
        game_id: ma.game_id.clone(),
        episode: 3,
        frame_number: 0,
    })
    .await?;
    assert_eq!(a.recv::<ErrorMsg>().await?.code, ErrorCode::GameNotFound);
    Ok(())
}

#[tokio::test]
async fn failed_validation_rematches_then_gives_up() -> anyhow::Result<()> {
    let addr = spawn_test_server(config(1)).await;
    let ((mut a, ma), (mut b, _mb)) = matched_pair(addr, "validation").await?;

    a.validate(&ma, false).await?;
    let second_a = a.recv::<GameMatched>().await?;
    let second_b = b.recv::<GameMatched>().await?;
    assert_eq!(second_a.game_id, ma.game_id);
    assert_eq!(second_a.validation_attempt, 2);
    assert_eq!(second_b.validation_attempt, 2);

    // A late answer for round 1 changes nothing.
    b.validate(&ma, false).await?;
    assert!(a.quiet::<GameEnded>(Duration::from_millis(100)).await?);

    b.validate(&second_b, false).await?;
    assert_eq!(a.recv::<GameEnded>().await?.reason, GameEndReason::ValidationFailed);
    assert_eq!(b.recv::<GameEnded>().await?.reason, GameEndReason::ValidationFailed);
    Ok(())
}

#[tokio::test]
async fn dropped_relay_connection_ends_game_for_partner() -> anyhow::Result<()> {
    let addr = spawn_test_server(config(1)).await;
    let ((mut a, _), (b, _)) = playing_pair(addr, "drop").await?;

    drop(b);
    let ended = a.recv::<GameEnded>().await?;
    assert_eq!(ended.reason, GameEndReason::PartnerDisconnected);
    Ok(())
}

#[tokio::test]
async fn exclusion_ends_game_for_everyone() -> anyhow::Result<()> {
    let addr = spawn_test_server(config(1)).await;
    let ((mut a, ma), (mut b, _)) = playing_pair(addr, "exclude").await?;

    a.send(&PlayerExcluded {
        game_id: ma.game_id.clone(),
        player_id: "exclude-a".into(),
        reason: "inactivity".into(),
    })
    .await?;
    assert_eq!(a.recv::<GameEnded>().await?.reason, GameEndReason::PartnerExcluded);
    assert_eq!(b.recv::<GameEnded>().await?.reason, GameEndReason::PartnerExcluded);
    Ok(())
}

#[tokio::test]
async fn cancel_leaves_the_pool() -> anyhow::Result<()> {
    let addr = spawn_test_server(config(1)).await;
    let mut a = TestClient::connect(addr).await?;
    let mut b = TestClient::connect(addr).await?;
    a.hello("cancel-a").await?;
    b.hello("cancel-b").await?;

    a.request_match("cancel", None).await?;
    assert_eq!(a.recv::<WaitingForMatch>().await?.waiting, 1);
    a.send(&CancelMatch {
        scene_id: "cancel".into(),
    })
    .await?;
    // Let the cancel land before the next request.
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.request_match("cancel", None).await?;
    assert_eq!(b.recv::<WaitingForMatch>().await?.waiting, 1);
    assert!(a.quiet::<GameMatched>(Duration::from_millis(100)).await?);
    Ok(())
}

#[tokio::test]
async fn protocol_misuse_is_answered_with_error_codes() -> anyhow::Result<()> {
    let addr = spawn_test_server(config(1)).await;

    let mut anon = TestClient::connect(addr).await?;
    anon.send(&Ping {
        nonce: 7,
        client_ms: 1234,
    })
    .await?;
    let pong = anon.recv::<Pong>().await?;
    assert_eq!((pong.nonce, pong.client_ms), (7, 1234));
    assert!(pong.server_ms > 0);

    anon.request_match("errors", None).await?;
    assert_eq!(anon.recv::<ErrorMsg>().await?.code, ErrorCode::NotIdentified);

    let mut first = TestClient::connect(addr).await?;
    first.hello("errors-dup").await?;
    let mut second = TestClient::connect(addr).await?;
    second
        .send(&mug_proto::messages::session::Hello {
            subject_id: "errors-dup".into(),
            proto_version: mug_proto::constants::VERSION,
        })
        .await?;
    assert_eq!(second.recv::<ErrorMsg>().await?.code, ErrorCode::DuplicateSubject);

    let ((mut a, ma), _b) = matched_pair(addr, "errors").await?;
    a.request_match("errors", None).await?;
    assert_eq!(a.recv::<ErrorMsg>().await?.code, ErrorCode::AlreadyMatched);

    // The connection survives errors.
    first.validate(&ma, true).await?;
    assert_eq!(first.recv::<ErrorMsg>().await?.code, ErrorCode::NotInGame);
    Ok(())
}
