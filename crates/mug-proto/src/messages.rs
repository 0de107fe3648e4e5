use crate::msg_id::MsgId;
use serde::de::DeserializeOwned;

pub mod matchmaking;
pub mod peer;
pub mod reconnect;
pub mod session;
pub mod signaling;
pub mod keepalive;

/// A trait for all relay protocol messages.
///
/// Each message type implements this trait to declare its associated `MsgId`,
/// enabling automatic header construction during encoding.
///
/// Implemented through [`impl_message!`]; do not implement it by hand.
pub trait Message: serde::Serialize + DeserializeOwned + Send + 'static {
    /// Returns the message identifier for this message type.
    fn msg_id() -> MsgId;
}

/// Bind message structs to their [`MsgId`].
#[macro_export]
macro_rules! impl_message {
    ($($ty:ty => $id:ident),* $(,)?) => {
        $(
            impl $crate::messages::Message for $ty {
                #[inline]
                fn msg_id() -> $crate::msg_id::MsgId {
                    $crate::msg_id::MsgId::$id
                }
            }
        )*
    };
}

impl_message! {
    session::Hello => Hello,
    session::Welcome => Welcome,
    session::ErrorMsg => Error,

    matchmaking::RequestMatch => RequestMatch,
    matchmaking::WaitingForMatch => WaitingForMatch,
    matchmaking::CancelMatch => CancelMatch,
    matchmaking::GameMatched => GameMatched,
    matchmaking::ValidationResult => ValidationResult,
    matchmaking::GameStarted => GameStarted,
    matchmaking::EpisodeComplete => EpisodeComplete,
    matchmaking::PlayerExcluded => PlayerExcluded,

    reconnect::ConnectionLost => ConnectionLost,
    reconnect::Pause => Pause,
    reconnect::ReconnectionSuccess => ReconnectionSuccess,
    reconnect::Resume => Resume,
    reconnect::ReconnectionTimeout => ReconnectionTimeout,
    reconnect::GameEnded => GameEnded,

    signaling::Signal => Signal,
    signaling::RelayedSignal => RelayedSignal,

    keepalive::Ping => Ping,
    keepalive::Pong => Pong,
}
