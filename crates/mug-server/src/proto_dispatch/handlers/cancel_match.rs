//! CancelMatchHandler - leaves the waiting pool.

use mug_proto::messages::matchmaking::CancelMatch;
use tracing::debug;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;

pub(crate) struct CancelMatchHandler;

impl Handler<CancelMatch> for CancelMatchHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: CancelMatch) -> HandlerResult {
        let subject = ctx.subject()?;
        let updates = ctx
            .state
            .lobbies
            .get_mut(&msg.scene_id)
            .and_then(|lobby| lobby.remove(&subject));
        match updates {
            Some(outbox) => outbox.flush().await,
            // Already matched or never waiting: nothing to undo.
            None => debug!(%subject, scene_id = %msg.scene_id, "Cancel for participant not waiting"),
        }
        Ok(())
    }
}
