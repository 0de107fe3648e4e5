//! Relay transport: TCP listener with native framing or WebSocket upgrade,
//! per-connection writer tasks and rate limiting.

pub mod inbound;
pub mod outbound;
pub mod rate_limit;
pub mod tcp;
pub mod websocket;
