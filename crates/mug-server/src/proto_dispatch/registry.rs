//! Message id to handler routing.

use std::collections::HashMap;

use mug_proto::msg_id::MsgId;
use tracing::warn;

use super::error::HandlerResult;
use super::handlers::{ErasedHandler, HandlerContext};

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: HashMap<MsgId, Box<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Route `msg_id` to `handler`. A second registration for the same id
    /// replaces the first.
    pub(crate) fn register(&mut self, msg_id: MsgId, handler: Box<dyn ErasedHandler>) {
        if self.handlers.insert(msg_id, handler).is_some() {
            warn!(?msg_id, "Handler registered twice, keeping the last one");
        }
    }

    /// `None` when nothing handles `msg_id`.
    pub(crate) async fn dispatch(
        &self,
        msg_id: MsgId,
        ctx: &mut HandlerContext<'_>,
        payload: &[u8],
    ) -> Option<HandlerResult> {
        let handler = self.handlers.get(&msg_id)?;
        Some(handler.handle_erased(ctx, payload).await)
    }

    #[cfg(test)]
    pub(crate) fn has_handler(&self, msg_id: MsgId) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Build a [`HandlerRegistry`] from `Message => handler` pairs; each handler
/// implements `Handler<Message>`.
macro_rules! handler_registry {
    ($($msg:ty => $handler:expr),* $(,)?) => {{
        let mut registry = $crate::proto_dispatch::registry::HandlerRegistry::new();
        $(
            registry.register(
                <$msg as mug_proto::messages::Message>::msg_id(),
                Box::new($crate::proto_dispatch::handlers::TypedHandler::<$msg, _>::new($handler)),
            );
        )*
        registry
    }};
}

pub(crate) use handler_registry;
