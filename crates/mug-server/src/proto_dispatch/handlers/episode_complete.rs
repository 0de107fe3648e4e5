//! EpisodeCompleteHandler - advances the shared episode count.

use std::time::Instant;

use mug_proto::messages::matchmaking::EpisodeComplete;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;

pub(crate) struct EpisodeCompleteHandler;

impl Handler<EpisodeComplete> for EpisodeCompleteHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: EpisodeComplete) -> HandlerResult {
        let (subject, shared) = ctx.participant_session(&msg.game_id)?;
        let outbox = shared
            .lock()
            .on_episode_complete(&subject, msg.episode, msg.frame_number, Instant::now());
        ctx.deliver(&msg.game_id, outbox).await;
        Ok(())
    }
}
