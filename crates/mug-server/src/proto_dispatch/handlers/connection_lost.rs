//! ConnectionLostHandler - pauses the room on the first loss report.

use std::time::Instant;

use mug_proto::messages::reconnect::ConnectionLost;
use tracing::warn;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;
use crate::unix_ms;

pub(crate) struct ConnectionLostHandler;

impl Handler<ConnectionLost> for ConnectionLostHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, mut msg: ConnectionLost) -> HandlerResult {
        let (subject, shared) = ctx.participant_session(&msg.game_id)?;
        if msg.player_id != subject {
            warn!(%subject, claimed = %msg.player_id, "Loss report names another player, using sender");
            msg.player_id = subject;
        }
        let outbox = shared
            .lock()
            .on_connection_lost(&msg, Instant::now(), unix_ms());
        ctx.deliver(&msg.game_id, outbox).await;
        Ok(())
    }
}
