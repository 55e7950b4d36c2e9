//! Byte-stream view of one logical channel

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::crypto::Fingerprint;
use crate::session::{Channel, ChannelCloser, Session};

/// A bidirectional byte stream over one logical channel
///
/// Carries no framing of its own: whatever protocol rides on top sees exactly
/// the bytes its peer wrote. The connection keeps its session alive, so on the
/// dialing side dropping it also ends the session.
pub struct Connection {
    channel: Channel,
    session: Arc<Session>,
}

impl Connection {
    pub(crate) fn new(channel: Channel, session: Arc<Session>) -> Self {
        Connection { channel, session }
    }

    /// Read available bytes into `buf`; `Ok(0)` means end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(&mut self.channel, buf).await
    }

    /// Write some of `buf`, waiting for the peer's window if needed
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AsyncWriteExt::write(&mut self.channel, buf).await
    }

    /// Close the channel
    ///
    /// Safe to call more than once, and after the peer has closed.
    pub fn close(&mut self) {
        self.channel.close();
    }

    /// Fingerprint of the authenticated peer key
    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.session.peer_fingerprint()
    }

    /// Type name the channel was negotiated with
    pub fn channel_type(&self) -> &str {
        self.channel.channel_type()
    }

    pub(crate) fn closer(&self) -> ChannelCloser {
        self.channel.closer()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.channel).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.channel).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.channel).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.channel).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel_type", &self.channel.channel_type())
            .field("peer", &self.peer_fingerprint())
            .finish()
    }
}
