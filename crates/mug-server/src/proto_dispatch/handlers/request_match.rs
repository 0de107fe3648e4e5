//! RequestMatchHandler - puts a participant in front of the scene's matchmaker.

use std::time::Instant;

use mug_proto::messages::matchmaking::RequestMatch;
use tracing::{info, warn};

use super::{Handler, HandlerContext};
use crate::matchmaking::lobby::WaitingEntry;
use crate::matchmaking::{MatchCandidate, MatchOutcome};
use crate::proto_dispatch::error::{HandlerError, HandlerResult};

pub(crate) struct RequestMatchHandler;

impl Handler<RequestMatch> for RequestMatchHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: RequestMatch) -> HandlerResult {
        let subject = ctx.subject()?;
        if msg.scene_id.is_empty() {
            return Err(HandlerError::bad_message());
        }
        if ctx.state.games.contains_subject(&subject) {
            warn!(%subject, "Match requested while in a game");
            return Err(HandlerError::already_matched());
        }
        if let Some(scene) = ctx.state.waiting_scene_of(&subject)
            && scene != msg.scene_id
        {
            warn!(%subject, waiting_in = %scene, requested = %msg.scene_id, "Match requested while waiting elsewhere");
            return Err(HandlerError::already_matched());
        }

        let entry = WaitingEntry {
            candidate: MatchCandidate {
                subject_id: subject.clone(),
                rtt_ms: msg.rtt_ms,
            },
            conn_id: ctx.conn_id,
            outbound: ctx.conn_ctx.outbound.clone(),
            since: Instant::now(),
        };
        let (lobby, games) = ctx.state.lobby_and_games(&msg.scene_id);
        let (outcome, outbox) = lobby.request(entry, games);
        if let MatchOutcome::Matched(game_id) = &outcome {
            info!(%subject, scene_id = %msg.scene_id, %game_id, "Request completed a match");
        }
        outbox.flush().await;
        Ok(())
    }
}
