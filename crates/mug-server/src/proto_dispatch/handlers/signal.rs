//! SignalHandler - relays WebRTC signaling between participants.

use mug_proto::messages::signaling::Signal;
use tracing::trace;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;

pub(crate) struct SignalHandler;

impl Handler<Signal> for SignalHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: Signal) -> HandlerResult {
        let (subject, shared) = ctx.participant_session(&msg.game_id)?;
        trace!(%subject, game_id = %msg.game_id, generation = msg.payload.generation(), "Relaying signal");
        let outbox = shared.lock().relay_signal(&subject, msg.payload);
        outbox.flush().await;
        Ok(())
    }
}
