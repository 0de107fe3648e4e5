//! Decoding and routing of client→server messages.

pub mod error;
pub mod handlers;
pub mod registry;
