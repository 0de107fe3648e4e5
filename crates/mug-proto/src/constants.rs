//! Protocol constants shared by the server and participants.

/// First two bytes of every relay frame header.
pub const MAGIC: [u8; 2] = *b"MG";

/// Relay protocol version. `Hello` carries it too, so a participant built
/// against another version is refused before it can be matched.
pub const VERSION: u8 = 1;

/// Relay frame header: magic, version, message id, payload length.
pub const HEADER_LEN: usize = 8;

/// Every relay frame travels as `[u32 len LE][header][payload]`, `len`
/// counting header and payload.
pub const TCP_LEN_PREFIX: usize = 4;

/// Actions per outbound input packet: the current frame and the nine
/// before it.
pub const DEFAULT_INPUT_REDUNDANCY: usize = 10;

/// Unacknowledged local actions a sender keeps resending. Input packets
/// carrying more actions than this are rejected.
pub const MAX_INPUT_BACKLOG: usize = 256;

/// How long a paused game waits for recovery before it ends.
pub const DEFAULT_RECONNECTION_TIMEOUT_MS: u64 = 30_000;
