//! Logical channels
//!
//! A [`Channel`] is one flow-controlled byte stream inside a session. Inbound
//! data arrives from the session reader task as [`ChannelEvent`]s; outbound
//! data is queued straight onto the session writer task, never more than the
//! peer's window allows.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::codec::Message;
use super::mux::Outbound;

/// Receive window granted to the peer when a channel opens
pub const INITIAL_WINDOW: u32 = 2 * 1024 * 1024;

/// Largest data payload in one CHANNEL_DATA message
pub const MAX_DATA_PER_PACKET: u32 = 32 * 1024;

/// Consumed bytes that trigger a window adjustment
pub const WINDOW_ADJUST_THRESHOLD: u32 = INITIAL_WINDOW / 2;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inbound event delivered to a channel
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Data(Bytes),
    Eof,
    Closed,
    Reset,
}

#[derive(Debug)]
struct FlowState {
    remote_window: u32,
    eof_sent: bool,
    close_sent: bool,
    remote_closed: bool,
    reset: bool,
}

/// State shared between a [`Channel`] and the session reader task
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) local_id: u32,
    pub(crate) remote_id: u32,
    pub(crate) channel_type: String,
    remote_max_packet: u32,
    local_window: AtomicU32,
    flow: Mutex<FlowState>,
    write_waker: AtomicWaker,
}

impl ChannelState {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        channel_type: String,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> Self {
        ChannelState {
            local_id,
            remote_id,
            channel_type,
            remote_max_packet: remote_max_packet.clamp(1, MAX_DATA_PER_PACKET),
            local_window: AtomicU32::new(INITIAL_WINDOW),
            flow: Mutex::new(FlowState {
                remote_window,
                eof_sent: false,
                close_sent: false,
                remote_closed: false,
                reset: false,
            }),
            write_waker: AtomicWaker::new(),
        }
    }

    /// Charge inbound data against our window; false if the peer overran it
    pub(crate) fn consume_window(&self, len: u32) -> bool {
        // Only the reader task subtracts, so a load then sub cannot underflow
        if len > self.local_window.load(Ordering::Acquire) {
            return false;
        }
        self.local_window.fetch_sub(len, Ordering::AcqRel);
        true
    }

    pub(crate) fn adjust_window(&self, bytes: u32) {
        let mut flow = lock(&self.flow);
        flow.remote_window = flow.remote_window.saturating_add(bytes);
        drop(flow);
        self.write_waker.wake();
    }

    pub(crate) fn send_eof(&self, outbound: &mpsc::UnboundedSender<Outbound>) {
        let mut flow = lock(&self.flow);
        if flow.reset || flow.eof_sent || flow.close_sent || flow.remote_closed {
            return;
        }
        flow.eof_sent = true;
        let _ = outbound.send(Outbound::Message(Message::ChannelEof {
            recipient: self.remote_id,
        }));
        drop(flow);
        self.write_waker.wake();
    }

    /// Send EOF and CLOSE once, whichever side gets here first
    pub(crate) fn close(&self, outbound: &mpsc::UnboundedSender<Outbound>) {
        let mut flow = lock(&self.flow);
        if flow.reset || flow.close_sent {
            return;
        }
        if !flow.eof_sent && !flow.remote_closed {
            flow.eof_sent = true;
            let _ = outbound.send(Outbound::Message(Message::ChannelEof {
                recipient: self.remote_id,
            }));
        }
        flow.close_sent = true;
        let _ = outbound.send(Outbound::Message(Message::ChannelClose {
            recipient: self.remote_id,
        }));
        drop(flow);
        self.write_waker.wake();
    }

    /// Peer sent CLOSE: answer it unless we already did
    pub(crate) fn remote_close(&self, outbound: &mpsc::UnboundedSender<Outbound>) {
        let mut flow = lock(&self.flow);
        flow.remote_closed = true;
        if !flow.close_sent {
            flow.close_sent = true;
            let _ = outbound.send(Outbound::Message(Message::ChannelClose {
                recipient: self.remote_id,
            }));
        }
        drop(flow);
        self.write_waker.wake();
    }

    /// Session died underneath the channel
    pub(crate) fn reset(&self) {
        lock(&self.flow).reset = true;
        self.write_waker.wake();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadEnd {
    Eof,
    Reset,
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "session closed")
}

/// One logical channel within a session
///
/// Dropping a channel closes it.
pub struct Channel {
    state: Arc<ChannelState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    pending: Bytes,
    consumed: u32,
    read_end: Option<ReadEnd>,
}

impl Channel {
    pub(crate) fn new(
        state: Arc<ChannelState>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> (Self, mpsc::UnboundedSender<ChannelEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let channel = Channel {
            state,
            outbound,
            events,
            pending: Bytes::new(),
            consumed: 0,
            read_end: None,
        };
        (channel, events_tx)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<ChannelState> {
        &self.state
    }

    /// Type name the channel was opened with
    pub fn channel_type(&self) -> &str {
        &self.state.channel_type
    }

    /// Our id for this channel
    pub fn local_id(&self) -> u32 {
        self.state.local_id
    }

    /// Signal that we will send no more data
    pub fn send_eof(&self) {
        self.state.send_eof(&self.outbound);
    }

    /// Close the channel; later calls do nothing
    pub fn close(&self) {
        self.state.close(&self.outbound);
    }

    /// Handle that can close this channel after it has been moved away
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            state: self.state.clone(),
            outbound: self.outbound.clone(),
        }
    }

    fn acknowledge(&mut self, n: usize) {
        self.consumed = self.consumed.saturating_add(n as u32);
        if self.consumed < WINDOW_ADJUST_THRESHOLD {
            return;
        }

        let flow = lock(&self.state.flow);
        if !flow.close_sent && !flow.remote_closed && !flow.reset {
            self.state
                .local_window
                .fetch_add(self.consumed, Ordering::AcqRel);
            let _ = self
                .outbound
                .send(Outbound::Message(Message::ChannelWindowAdjust {
                    recipient: self.state.remote_id,
                    bytes: self.consumed,
                }));
        }
        drop(flow);
        self.consumed = 0;
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                this.acknowledge(n);
                return Poll::Ready(Ok(()));
            }

            match this.read_end {
                Some(ReadEnd::Eof) => return Poll::Ready(Ok(())),
                Some(ReadEnd::Reset) => return Poll::Ready(Err(reset_error())),
                None => {}
            }

            match ready!(this.events.poll_recv(cx)) {
                Some(ChannelEvent::Data(data)) => this.pending = data,
                Some(ChannelEvent::Eof) | Some(ChannelEvent::Closed) => {
                    this.read_end = Some(ReadEnd::Eof)
                }
                Some(ChannelEvent::Reset) | None => this.read_end = Some(ReadEnd::Reset),
            }
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut flow = lock(&this.state.flow);
        if flow.reset {
            return Poll::Ready(Err(reset_error()));
        }
        if flow.eof_sent || flow.close_sent || flow.remote_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel closed",
            )));
        }
        if flow.remote_window == 0 {
            this.state.write_waker.register(cx.waker());
            return Poll::Pending;
        }

        let n = buf
            .len()
            .min(flow.remote_window as usize)
            .min(this.state.remote_max_packet as usize);
        flow.remote_window -= n as u32;

        // Queued under the lock so data never trails our CLOSE
        let sent = this.outbound.send(Outbound::Message(Message::ChannelData {
            recipient: this.state.remote_id,
            data: Bytes::copy_from_slice(&buf[..n]),
        }));
        if sent.is_err() {
            flow.reset = true;
            return Poll::Ready(Err(reset_error()));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.send_eof();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.state.local_id)
            .field("remote_id", &self.state.remote_id)
            .field("channel_type", &self.state.channel_type)
            .finish_non_exhaustive()
    }
}

/// Detached close handle for a [`Channel`]
#[derive(Clone)]
pub struct ChannelCloser {
    state: Arc<ChannelState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ChannelCloser {
    /// Close the channel; does nothing if it is already closed
    pub fn close(&self) {
        self.state.close(&self.outbound);
    }
}

impl std::fmt::Debug for ChannelCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCloser")
            .field("local_id", &self.state.local_id)
            .finish()
    }
}
