use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use mug_proto::messages::Message;
use mug_proto::messages::session::ErrorMsg;
use mug_proto::packet::Packet;
use mug_proto::{GameId, SubjectId};
use tracing::{debug, warn};

use super::error::{HandlerError, HandlerResult};
use super::registry::HandlerRegistry;
use crate::game::SharedSession;
use crate::net::inbound::ConnId;
use crate::net::outbound::{Outbox, send_msg};
use crate::{ConnCtx, ServerState};

mod cancel_match;
mod connection_lost;
mod episode_complete;
mod hello;
mod ping;
mod player_excluded;
mod reconnection_success;
mod reconnection_timeout;
mod request_match;
mod signal;
mod validation_result;

pub(crate) use cancel_match::CancelMatchHandler;
pub(crate) use connection_lost::ConnectionLostHandler;
pub(crate) use episode_complete::EpisodeCompleteHandler;
pub(crate) use hello::HelloHandler;
pub(crate) use ping::PingHandler;
pub(crate) use player_excluded::PlayerExcludedHandler;
pub(crate) use reconnection_success::ReconnectionSuccessHandler;
pub(crate) use reconnection_timeout::ReconnectionTimeoutHandler;
pub(crate) use request_match::RequestMatchHandler;
pub(crate) use signal::SignalHandler;
pub(crate) use validation_result::ValidationResultHandler;

/// Everything a handler may touch while processing one packet.
pub(crate) struct HandlerContext<'a> {
    pub conn_id: ConnId,
    pub peer: SocketAddr,
    pub conn_ctx: &'a mut ConnCtx,
    pub state: &'a mut ServerState,
}

impl HandlerContext<'_> {
    /// Subject id bound by `Hello`.
    pub fn subject(&self) -> Result<SubjectId, HandlerError> {
        self.conn_ctx
            .subject_id
            .clone()
            .ok_or_else(HandlerError::not_identified)
    }

    /// The sender's subject id and the game `game_id` names, checking that
    /// the sender plays in it.
    pub fn participant_session(
        &self,
        game_id: &GameId,
    ) -> Result<(SubjectId, SharedSession), HandlerError> {
        let subject = self.subject()?;
        let Some(session) = self.state.games.get(game_id) else {
            debug!(conn_id = self.conn_id, %subject, %game_id, "Message for unknown or ended game");
            return Err(HandlerError::game_not_found());
        };
        if !session.lock().has_player(&subject) {
            warn!(conn_id = self.conn_id, %subject, %game_id, "Sender is not a participant");
            return Err(HandlerError::not_in_game());
        }
        Ok((subject, session))
    }

    /// Remove `game_id` if the handler ended it, then send `outbox`.
    pub async fn deliver(&mut self, game_id: &GameId, outbox: Outbox) {
        self.state.games.remove_if_ended(game_id);
        outbox.flush().await;
    }
}

/// Typed handler for one message type.
pub(crate) trait Handler<M: Message>: Send + Sync {
    fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        msg: M,
    ) -> impl Future<Output = HandlerResult> + Send;
}

/// Object-safe handler taking the raw payload.
pub(crate) trait ErasedHandler: Send + Sync {
    fn handle_erased<'a, 'b: 'a>(
        &'a self,
        ctx: &'a mut HandlerContext<'b>,
        payload: &'a [u8],
    ) -> BoxFuture<'a, HandlerResult>;
}

/// Decodes the payload as `M` before calling `H`.
pub(crate) struct TypedHandler<M, H> {
    handler: H,
    _marker: PhantomData<fn() -> M>,
}

impl<M, H> TypedHandler<M, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<M, H> ErasedHandler for TypedHandler<M, H>
where
    M: Message,
    H: Handler<M>,
{
    fn handle_erased<'a, 'b: 'a>(
        &'a self,
        ctx: &'a mut HandlerContext<'b>,
        payload: &'a [u8],
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let msg: M = match postcard::from_bytes(payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        conn_id = ctx.conn_id,
                        peer = %ctx.peer,
                        msg_id = ?M::msg_id(),
                        error = %e,
                        "Failed to decode message"
                    );
                    return Err(HandlerError::bad_message());
                }
            };
            self.handler.handle(ctx, msg).await
        })
    }
}

/// Tell the client why its message was rejected.
pub(crate) async fn send_error_response(ctx: &ConnCtx, err: HandlerError) {
    let msg = ErrorMsg { code: err.code };
    if let Err(e) = send_msg(&ctx.outbound, &msg).await {
        warn!(peer = %ctx.peer, error = %e, "Failed to send error response");
    }
}

/// All client→server handlers.
pub(crate) fn build_registry() -> HandlerRegistry {
    use mug_proto::messages::{keepalive, matchmaking, reconnect, session, signaling};

    super::registry::handler_registry! {
        session::Hello => HelloHandler,
        keepalive::Ping => PingHandler,
        matchmaking::RequestMatch => RequestMatchHandler,
        matchmaking::CancelMatch => CancelMatchHandler,
        matchmaking::ValidationResult => ValidationResultHandler,
        matchmaking::EpisodeComplete => EpisodeCompleteHandler,
        matchmaking::PlayerExcluded => PlayerExcludedHandler,
        reconnect::ConnectionLost => ConnectionLostHandler,
        reconnect::ReconnectionSuccess => ReconnectionSuccessHandler,
        reconnect::ReconnectionTimeout => ReconnectionTimeoutHandler,
        signaling::Signal => SignalHandler,
    }
}

/// Route one packet. Handler errors are answered with `ErrorMsg`.
pub(crate) async fn dispatch_packet(
    registry: &HandlerRegistry,
    ctx: &mut HandlerContext<'_>,
    packet: &Packet,
) {
    let msg_id = packet.msg_id();
    match registry.dispatch(msg_id, ctx, &packet.payload).await {
        Some(Ok(())) => {}
        Some(Err(err)) => {
            debug!(conn_id = ctx.conn_id, ?msg_id, code = ?err.code, "Handler rejected message");
            send_error_response(ctx.conn_ctx, err).await;
        }
        None => {
            warn!(
                conn_id = ctx.conn_id,
                peer = %ctx.peer,
                ?msg_id,
                payload_len = packet.payload.len(),
                "Unhandled message (ignored)"
            );
        }
    }
}
