//! Relay RTT pings.

use mug_proto::messages::keepalive::{Ping, Pong};
use tracing::trace;

use super::{Handler, HandlerContext};
use crate::net::outbound::send_msg;
use crate::proto_dispatch::error::HandlerResult;
use crate::unix_ms;

/// Echoes the ping with the server clock attached. Works before `Hello` so
/// participants can measure their RTT first.
pub(crate) struct PingHandler;

impl Handler<Ping> for PingHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: Ping) -> HandlerResult {
        let pong = Pong {
            nonce: msg.nonce,
            client_ms: msg.client_ms,
            server_ms: unix_ms(),
        };
        if send_msg(&ctx.conn_ctx.outbound, &pong).await.is_err() {
            trace!(conn_id = ctx.conn_id, "Pong not delivered, connection closing");
        }
        Ok(())
    }
}
