//! ReconnectionTimeoutHandler - ends a paused game whose link never came back.

use std::time::Instant;

use mug_proto::messages::reconnect::ReconnectionTimeout;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;
use crate::unix_ms;

pub(crate) struct ReconnectionTimeoutHandler;

impl Handler<ReconnectionTimeout> for ReconnectionTimeoutHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: ReconnectionTimeout) -> HandlerResult {
        let (subject, shared) = ctx.participant_session(&msg.game_id)?;
        let outbox = shared
            .lock()
            .on_reconnection_timeout(&subject, Instant::now(), unix_ms());
        ctx.deliver(&msg.game_id, outbox).await;
        Ok(())
    }
}
