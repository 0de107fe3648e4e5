//! Browser participants reach the relay over WebSocket. Their binary
//! messages carry ordinary relay frames, possibly split or coalesced, so the
//! socket is turned back into a byte stream and fed to the same reader as
//! native TCP.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use futures_util::Stream;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

pub struct WsByteStream<S> {
    messages: S,
    /// Unread rest of the last binary message.
    chunk: Bytes,
}

impl<S> WsByteStream<S> {
    pub fn new(messages: S) -> Self {
        Self {
            messages,
            chunk: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.chunk.is_empty() {
            match ready!(Pin::new(&mut this.messages).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.chunk = data,
                Some(Ok(Message::Text(text))) => {
                    warn!(len = text.len(), "Ignoring text message on relay socket");
                }
                // EOF
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by peer");
                    return Poll::Ready(Ok(()));
                }
                None => return Poll::Ready(Ok(())),
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
        let n = buf.remaining().min(this.chunk.len());
        buf.put_slice(&this.chunk[..n]);
        this.chunk.advance(n);
        Poll::Ready(Ok(()))
    }
}
