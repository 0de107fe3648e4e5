//! HelloHandler - binds a subject id to the connection.

use std::sync::atomic::Ordering;

use mug_proto::constants::VERSION;
use mug_proto::messages::session::{Hello, Welcome};
use tracing::{error, info, warn};

use super::{Handler, HandlerContext};
use crate::net::outbound::send_msg;
use crate::proto_dispatch::error::{HandlerError, HandlerResult};
use crate::{NEXT_CLIENT_ID, unix_ms};

pub(crate) struct HelloHandler;

impl Handler<Hello> for HelloHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: Hello) -> HandlerResult {
        if msg.proto_version != VERSION {
            warn!(peer = %ctx.peer, version = msg.proto_version, "Unsupported protocol version");
            return Err(HandlerError::unsupported_version());
        }
        if msg.subject_id.is_empty() {
            return Err(HandlerError::bad_message());
        }

        match ctx.conn_ctx.subject_id.clone() {
            // A retried Hello on the same connection gets the same answer.
            Some(bound) if bound == msg.subject_id => {}
            Some(bound) => {
                warn!(conn_id = ctx.conn_id, %bound, requested = %msg.subject_id, "Hello with a different subject id");
                return Err(HandlerError::invalid_state());
            }
            None => {
                if let Some(&other) = ctx.state.subjects.get(&msg.subject_id)
                    && other != ctx.conn_id
                {
                    warn!(
                        conn_id = ctx.conn_id,
                        other_conn = other,
                        subject = %msg.subject_id,
                        "Subject already connected"
                    );
                    return Err(HandlerError::duplicate_subject());
                }
                ctx.conn_ctx.subject_id = Some(msg.subject_id.clone());
                ctx.conn_ctx.client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
                ctx.state.subjects.insert(msg.subject_id.clone(), ctx.conn_id);
            }
        }

        let welcome = Welcome {
            client_id: ctx.conn_ctx.client_id,
            server_time_ms: unix_ms(),
        };
        match send_msg(&ctx.conn_ctx.outbound, &welcome).await {
            Ok(()) => info!(
                conn_id = ctx.conn_id,
                client_id = ctx.conn_ctx.client_id,
                subject = %msg.subject_id,
                transport = ?ctx.conn_ctx.transport,
                "Hello/Welcome handshake completed"
            ),
            Err(e) => error!(peer = %ctx.peer, error = %e, "Failed to send Welcome"),
        }
        Ok(())
    }
}
