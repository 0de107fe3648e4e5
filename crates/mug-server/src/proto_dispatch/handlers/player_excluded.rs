//! PlayerExcludedHandler - ends the game when a participant is excluded.

use std::time::Instant;

use mug_proto::messages::matchmaking::PlayerExcluded;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;

pub(crate) struct PlayerExcludedHandler;

impl Handler<PlayerExcluded> for PlayerExcludedHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: PlayerExcluded) -> HandlerResult {
        let (subject, shared) = ctx.participant_session(&msg.game_id)?;
        let outbox = shared.lock().on_player_excluded(
            &subject,
            &msg.player_id,
            &msg.reason,
            Instant::now(),
        );
        ctx.deliver(&msg.game_id, outbox).await;
        Ok(())
    }
}
