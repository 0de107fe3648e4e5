//! ReconnectionSuccessHandler - resumes once every lost player is back.

use std::time::Instant;

use mug_proto::messages::reconnect::ReconnectionSuccess;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;
use crate::unix_ms;

pub(crate) struct ReconnectionSuccessHandler;

impl Handler<ReconnectionSuccess> for ReconnectionSuccessHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: ReconnectionSuccess) -> HandlerResult {
        let (subject, shared) = ctx.participant_session(&msg.game_id)?;
        let outbox = shared.lock().on_reconnection_success(
            &subject,
            msg.restart_attempts,
            Instant::now(),
            unix_ms(),
        );
        ctx.deliver(&msg.game_id, outbox).await;
        Ok(())
    }
}
