//! ValidationResultHandler - collects pre-game peer checks.

use std::time::Instant;

use mug_proto::messages::matchmaking::ValidationResult;

use super::{Handler, HandlerContext};
use crate::game::session::ValidationStep;
use crate::net::outbound::Outbox;
use crate::proto_dispatch::error::HandlerResult;

pub(crate) struct ValidationResultHandler;

impl Handler<ValidationResult> for ValidationResultHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: ValidationResult) -> HandlerResult {
        let (subject, shared) = ctx.participant_session(&msg.game_id)?;
        let outbox = {
            let mut session = shared.lock();
            match session.on_validation_result(&subject, msg.attempt, msg.ok) {
                ValidationStep::Pending => Outbox::new(),
                ValidationStep::Started(outbox) => outbox,
                ValidationStep::Failed => {
                    let scene_id = session.scene_id().to_string();
                    let (lobby, _) = ctx.state.lobby_and_games(&scene_id);
                    lobby.rematch(&mut session, Instant::now())
                }
            }
        };
        ctx.deliver(&msg.game_id, outbox).await;
        Ok(())
    }
}
