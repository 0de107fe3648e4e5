//! Two participants playing through a real relay server over loopback
//! peer links.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{LoopbackHub, RecordingOverlay, ScriptedHost, options, spawn_test_server};
use mug_netplay::{
    ClientPhase, Overlay, ParticipantOptions, ParticipantSummary, run_participant,
};
use mug_proto::messages::reconnect::{GameEndReason, ReconnectionOutcome};
use mug_server::{SceneConfig, ServerConfig};
use tokio::task::JoinHandle;

const GAME_TIMEOUT: Duration = Duration::from_secs(20);

fn server_config(num_episodes: u32) -> ServerConfig {
    ServerConfig {
        default_scene: SceneConfig {
            num_episodes,
            ..SceneConfig::default()
        },
        ..ServerConfig::default()
    }
}

type Running = JoinHandle<Result<ParticipantSummary, mug_netplay::NetplayError>>;

fn spawn_participant(
    server: std::net::SocketAddr,
    hub: &LoopbackHub,
    subject: &str,
    scene: &str,
    host: ScriptedHost,
    overlay: RecordingOverlay,
) -> Running {
    spawn_with(options(server, subject, scene), hub, host, overlay)
}

fn spawn_with(
    opts: ParticipantOptions,
    hub: &LoopbackHub,
    host: ScriptedHost,
    overlay: RecordingOverlay,
) -> Running {
    let links = hub.factory();
    tokio::spawn(async move { run_participant(opts, links, host, overlay).await })
}

async fn finish(handle: Running) -> anyhow::Result<ParticipantSummary> {
    let summary = tokio::time::timeout(GAME_TIMEOUT, handle).await???;
    Ok(summary)
}

/// Frames both sides hashed with confirmed inputs must agree.
fn assert_checksums_agree(a: &ParticipantSummary, b: &ParticipantSummary) -> usize {
    let theirs: BTreeMap<u32, _> = b
        .confirmed_checksums
        .iter()
        .map(|c| (c.frame, c.hash))
        .collect();
    let mut common = 0;
    for c in &a.confirmed_checksums {
        if let Some(hash) = theirs.get(&c.frame) {
            assert_eq!(&c.hash, hash, "state diverged at frame {}", c.frame);
            common += 1;
        }
    }
    common
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_participants_play_every_episode() -> anyhow::Result<()> {
    let server = spawn_test_server(server_config(2)).await;
    let hub = LoopbackHub::new();

    let host_a = ScriptedHost::new(120);
    let rendered_a = host_a.rendered.clone();
    let a = spawn_participant(server, &hub, "play-a", "play", host_a, RecordingOverlay::default());
    // This side measures its own round trip to the relay.
    let b = spawn_with(
        ParticipantOptions {
            rtt_ms: None,
            ..options(server, "play-b", "play")
        },
        &hub,
        ScriptedHost::new(120),
        RecordingOverlay::default(),
    );

    let (a, b) = (finish(a).await?, finish(b).await?);

    for s in [&a, &b] {
        assert_eq!(s.phase, ClientPhase::Ended(GameEndReason::Completed));
        let ended = s.game_ended.as_ref().expect("game ended");
        assert_eq!(ended.reason, GameEndReason::Completed);
        assert!(ended.reconnection_data.disconnections.is_empty());
        assert!(s.desyncs.is_empty());
    }
    assert_eq!(a.game_id, b.game_id);
    assert!(assert_checksums_agree(&a, &b) > 0);
    assert!(*rendered_a.lock() >= 240);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_link_pauses_recovers_and_completes() -> anyhow::Result<()> {
    let server = spawn_test_server(server_config(1)).await;
    let hub = LoopbackHub::new();

    let overlay_a = RecordingOverlay::default();
    let overlay_b = RecordingOverlay::default();
    let a = spawn_participant(
        server,
        &hub,
        "recover-a",
        "recover",
        ScriptedHost::new(300),
        overlay_a.clone(),
    );
    let b = spawn_participant(
        server,
        &hub,
        "recover-b",
        "recover",
        ScriptedHost::new(300),
        overlay_b.clone(),
    );

    tokio::time::timeout(GAME_TIMEOUT, hub.wait_for_traffic(60)).await?;
    hub.break_links();
    tokio::time::sleep(Duration::from_millis(500)).await;
    hub.heal();

    let (a, b) = (finish(a).await?, finish(b).await?);

    for s in [&a, &b] {
        assert_eq!(s.phase, ClientPhase::Ended(GameEndReason::Completed));
    }
    let data = &a.game_ended.as_ref().expect("game ended").reconnection_data;
    assert!(!data.disconnections.is_empty());
    assert_eq!(data.reconnection_attempts.len(), 1);
    assert_eq!(
        data.reconnection_attempts[0].outcome,
        ReconnectionOutcome::Recovered
    );
    assert_eq!(b.game_ended.as_ref().map(|e| &e.reconnection_data), Some(data));

    for overlay in [&overlay_a, &overlay_b] {
        let shown = overlay.shown.lock().clone();
        assert_eq!(
            shown,
            vec![
                Overlay::ConnectionLost,
                Overlay::GameEnded(GameEndReason::Completed)
            ]
        );
        assert_eq!(*overlay.hides.lock(), 1);
    }
    Ok(())
}
