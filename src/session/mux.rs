//! Session multiplexer
//!
//! An established handshake is split into two background tasks: a writer
//! that owns the encrypting half and drains a queue of outbound messages, and
//! a reader that owns the decrypting half and routes every inbound message to
//! the channel it belongs to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, Instrument};

use super::channel::{
    lock, Channel, ChannelEvent, ChannelState, INITIAL_WINDOW, MAX_DATA_PER_PACKET,
};
use super::codec::{
    Message, OpenFailureReason, DISCONNECT_BY_APPLICATION, DISCONNECT_PROTOCOL_ERROR,
};
use super::error::{ChannelOpenError, ProtocolError, ProtocolResult};
use super::handshake::{Established, SESSION_ID_SIZE};
use super::packet::{PacketReader, PacketWriter};
use crate::crypto::{Fingerprint, PublicKey};

/// Channel requests queued before the session stops reading from its peer
pub const INCOMING_BACKLOG: usize = 16;

/// Work item for the session writer task
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Message),
    /// Written last; the writer shuts down afterwards
    Disconnect(Message),
}

struct ChannelSlot {
    state: Arc<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

struct PendingOpen {
    channel_type: String,
    reply: oneshot::Sender<Result<Channel, ChannelOpenError>>,
}

#[derive(Default)]
struct ChannelTable {
    next_id: u32,
    open: HashMap<u32, ChannelSlot>,
    pending: HashMap<u32, PendingOpen>,
    closed: bool,
}

impl ChannelTable {
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.open.contains_key(&id) && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// State shared by the session handle, its channels and its tasks
pub(crate) struct MuxShared {
    outbound: mpsc::UnboundedSender<Outbound>,
    table: Mutex<ChannelTable>,
}

impl MuxShared {
    fn send(&self, message: Message) {
        let _ = self.outbound.send(Outbound::Message(message));
    }

    fn disconnect(&self, reason: u32, description: &str) {
        let _ = self.outbound.send(Outbound::Disconnect(Message::Disconnect {
            reason,
            description: description.to_string(),
        }));
    }

    fn is_closed(&self) -> bool {
        lock(&self.table).closed
    }

    /// Register a channel under `local_id` and build its handle
    fn attach(
        &self,
        table: &mut ChannelTable,
        local_id: u32,
        remote_id: u32,
        channel_type: String,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> Channel {
        let state = Arc::new(ChannelState::new(
            local_id,
            remote_id,
            channel_type,
            remote_window,
            remote_max_packet,
        ));
        let (channel, events) = Channel::new(state.clone(), self.outbound.clone());
        table.open.insert(local_id, ChannelSlot { state, events });
        channel
    }

    async fn open_channel(&self, channel_type: &str) -> Result<Channel, ChannelOpenError> {
        let (reply, response) = oneshot::channel();
        let local_id = {
            let mut table = lock(&self.table);
            if table.closed {
                return Err(ChannelOpenError::SessionClosed);
            }
            let id = table.allocate_id();
            table.pending.insert(
                id,
                PendingOpen {
                    channel_type: channel_type.to_string(),
                    reply,
                },
            );
            id
        };

        self.send(Message::ChannelOpen {
            channel_type: channel_type.to_string(),
            sender: local_id,
            window: INITIAL_WINDOW,
            max_packet: MAX_DATA_PER_PACKET,
        });

        response
            .await
            .unwrap_or(Err(ChannelOpenError::SessionClosed))
    }

    /// Route one inbound message
    fn dispatch(self: &Arc<Self>, message: Message) -> ProtocolResult<Routed> {
        match message {
            Message::Disconnect { description, .. } => {
                debug!(reason = %description, "Peer disconnected");
                return Ok(Routed::Stop);
            }
            Message::GlobalRequest {
                name, want_reply, ..
            } => {
                trace!(request = %name, "Discarding global request");
                if want_reply {
                    self.send(Message::RequestFailure);
                }
            }
            Message::RequestSuccess | Message::RequestFailure | Message::Ignore => {}
            Message::ChannelOpen {
                channel_type,
                sender,
                window,
                max_packet,
            } => {
                return Ok(Routed::Request(ChannelRequest {
                    shared: self.clone(),
                    channel_type,
                    remote_id: sender,
                    remote_window: window,
                    remote_max_packet: max_packet,
                    answered: false,
                }));
            }
            Message::ChannelOpenConfirmation {
                recipient,
                sender,
                window,
                max_packet,
            } => {
                let opened = {
                    let mut table = lock(&self.table);
                    match table.pending.remove(&recipient) {
                        Some(pending) => {
                            let channel = self.attach(
                                &mut table,
                                recipient,
                                sender,
                                pending.channel_type,
                                window,
                                max_packet,
                            );
                            Some((pending.reply, channel))
                        }
                        None => None,
                    }
                };
                match opened {
                    // A dropped opener drops the channel here, outside the lock
                    Some((reply, channel)) => drop(reply.send(Ok(channel))),
                    None => {
                        return Err(ProtocolError::Malformed(format!(
                            "confirmation for unknown channel {}",
                            recipient
                        )))
                    }
                }
            }
            Message::ChannelOpenFailure {
                recipient,
                reason,
                description,
            } => {
                let pending = lock(&self.table).pending.remove(&recipient);
                match pending {
                    Some(pending) => {
                        let _ = pending.reply.send(Err(ChannelOpenError::Rejected {
                            reason,
                            description,
                        }));
                    }
                    None => {
                        return Err(ProtocolError::Malformed(format!(
                            "open failure for unknown channel {}",
                            recipient
                        )))
                    }
                }
            }
            Message::ChannelWindowAdjust { recipient, bytes } => {
                let state = lock(&self.table)
                    .open
                    .get(&recipient)
                    .map(|slot| slot.state.clone());
                match state {
                    Some(state) => state.adjust_window(bytes),
                    None => trace!(channel = recipient, "Window adjust for closed channel"),
                }
            }
            Message::ChannelData { recipient, data } => {
                if data.len() > MAX_DATA_PER_PACKET as usize {
                    return Err(ProtocolError::PacketTooLarge {
                        size: data.len(),
                        max: MAX_DATA_PER_PACKET as usize,
                    });
                }
                let table = lock(&self.table);
                match table.open.get(&recipient) {
                    Some(slot) => {
                        if !slot.state.consume_window(data.len() as u32) {
                            return Err(ProtocolError::Malformed(format!(
                                "channel {} data exceeds window",
                                recipient
                            )));
                        }
                        let _ = slot.events.send(ChannelEvent::Data(data));
                    }
                    None => trace!(channel = recipient, "Data for closed channel"),
                }
            }
            Message::ChannelEof { recipient } => {
                if let Some(slot) = lock(&self.table).open.get(&recipient) {
                    let _ = slot.events.send(ChannelEvent::Eof);
                }
            }
            Message::ChannelClose { recipient } => {
                let slot = lock(&self.table).open.remove(&recipient);
                if let Some(slot) = slot {
                    slot.state.remote_close(&self.outbound);
                    let _ = slot.events.send(ChannelEvent::Closed);
                }
            }
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "{} after handshake",
                    other.name()
                )))
            }
        }

        Ok(Routed::Done)
    }

    /// Fail everything still attached to the session
    fn teardown(&self) {
        let (open, pending) = {
            let mut table = lock(&self.table);
            table.closed = true;
            (
                std::mem::take(&mut table.open),
                std::mem::take(&mut table.pending),
            )
        };

        for slot in open.into_values() {
            slot.state.reset();
            let _ = slot.events.send(ChannelEvent::Reset);
        }
        for pending in pending.into_values() {
            let _ = pending.reply.send(Err(ChannelOpenError::SessionClosed));
        }
    }
}

/// What the reader does after routing one message
enum Routed {
    Done,
    /// A channel request that still needs a place in the incoming queue
    Request(ChannelRequest),
    Stop,
}

struct TeardownOnExit(Arc<MuxShared>);

impl Drop for TeardownOnExit {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

/// Hand a request to the server, or refuse it when nobody takes requests
///
/// A full queue blocks the reader, so the peer is held back by the transport
/// instead of having its requests refused.
async fn queue_request(
    request: ChannelRequest,
    incoming: Option<&mpsc::Sender<ChannelRequest>>,
) {
    let sender = match incoming {
        Some(sender) => sender,
        None => {
            request.reject(OpenFailureReason::UnknownChannelType, "unknown channel type");
            return;
        }
    };

    if let Err(mpsc::error::SendError(request)) = sender.send(request).await {
        request.reject(OpenFailureReason::UnknownChannelType, "unknown channel type");
    }
}

async fn run_reader(
    mut reader: PacketReader,
    shared: Arc<MuxShared>,
    incoming: Option<mpsc::Sender<ChannelRequest>>,
) {
    // Runs on normal exit and on abort
    let _teardown = TeardownOnExit(shared.clone());

    loop {
        let message = match reader.read_message().await {
            Ok(message) => message,
            Err(ProtocolError::Closed) => {
                debug!("Session closed by peer");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Session read failed");
                shared.disconnect(DISCONNECT_PROTOCOL_ERROR, "protocol error");
                break;
            }
        };

        match shared.dispatch(message) {
            Ok(Routed::Done) => {}
            Ok(Routed::Request(request)) => queue_request(request, incoming.as_ref()).await,
            Ok(Routed::Stop) => break,
            Err(e) => {
                debug!(error = %e, "Protocol violation");
                shared.disconnect(DISCONNECT_PROTOCOL_ERROR, &e.to_string());
                break;
            }
        }
    }
}

async fn run_writer(mut writer: PacketWriter, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(message) => {
                if let Err(e) = writer.write_message(&message).await {
                    debug!(error = %e, "Session write failed");
                    break;
                }
            }
            Outbound::Disconnect(message) => {
                let _ = writer.write_message(&message).await;
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

/// An authenticated, encrypted session carrying logical channels
///
/// Dropping the last handle disconnects the session.
pub struct Session {
    shared: Arc<MuxShared>,
    reader: JoinHandle<()>,
    session_id: [u8; SESSION_ID_SIZE],
    peer_key: PublicKey,
}

impl Session {
    fn start(
        established: Established,
        incoming: Option<mpsc::Sender<ChannelRequest>>,
    ) -> Arc<Session> {
        let Established {
            reader,
            writer,
            session_id,
            peer_key,
        } = established;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MuxShared {
            outbound,
            table: Mutex::new(ChannelTable::default()),
        });

        tokio::spawn(run_writer(writer, outbound_rx).in_current_span());
        let reader = tokio::spawn(run_reader(reader, shared.clone(), incoming).in_current_span());

        Arc::new(Session {
            shared,
            reader,
            session_id,
            peer_key,
        })
    }

    /// Start the client side: the peer may not open channels towards us
    pub fn client(established: Established) -> Arc<Session> {
        Self::start(established, None)
    }

    /// Start the server side, returning the stream of inbound channel requests
    pub fn serve(established: Established) -> (Arc<Session>, IncomingChannels) {
        let (tx, rx) = mpsc::channel(INCOMING_BACKLOG);
        let session = Self::start(established, Some(tx));
        (session, IncomingChannels { requests: rx })
    }

    /// Ask the peer for a new channel of `channel_type`
    pub async fn open_channel(&self, channel_type: &str) -> Result<Channel, ChannelOpenError> {
        self.shared.open_channel(channel_type).await
    }

    /// Authenticated public key of the peer
    pub fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    /// Fingerprint of the peer's key
    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.peer_key.fingerprint()
    }

    /// Exchange hash identifying this session
    pub fn session_id(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.session_id
    }

    /// Whether the reader task has stopped
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Send DISCONNECT and stop writing
    pub fn disconnect(&self) {
        self.shared
            .disconnect(DISCONNECT_BY_APPLICATION, "disconnected by application");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
        self.reader.abort();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &hex::encode(&self.session_id[..8]))
            .field("peer", &self.peer_fingerprint())
            .finish_non_exhaustive()
    }
}

/// Channel requests arriving on a server session
#[derive(Debug)]
pub struct IncomingChannels {
    requests: mpsc::Receiver<ChannelRequest>,
}

impl IncomingChannels {
    /// Next request, or `None` once the session has ended
    pub async fn next(&mut self) -> Option<ChannelRequest> {
        self.requests.recv().await
    }
}

/// A peer's request to open a channel, awaiting our answer
///
/// Dropping it unanswered rejects it.
pub struct ChannelRequest {
    shared: Arc<MuxShared>,
    channel_type: String,
    remote_id: u32,
    remote_window: u32,
    remote_max_packet: u32,
    answered: bool,
}

impl ChannelRequest {
    /// Type name the peer asked for
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Accept the request
    pub fn accept(mut self) -> Result<Channel, ChannelOpenError> {
        self.answered = true;
        let (local_id, channel) = {
            let mut table = lock(&self.shared.table);
            if table.closed {
                return Err(ChannelOpenError::SessionClosed);
            }
            let id = table.allocate_id();
            let channel = self.shared.attach(
                &mut table,
                id,
                self.remote_id,
                std::mem::take(&mut self.channel_type),
                self.remote_window,
                self.remote_max_packet,
            );
            (id, channel)
        };

        self.shared.send(Message::ChannelOpenConfirmation {
            recipient: self.remote_id,
            sender: local_id,
            window: INITIAL_WINDOW,
            max_packet: MAX_DATA_PER_PACKET,
        });
        Ok(channel)
    }

    /// Refuse the request with `reason`
    pub fn reject(mut self, reason: OpenFailureReason, description: &str) {
        self.send_failure(reason, description);
    }

    fn send_failure(&mut self, reason: OpenFailureReason, description: &str) {
        if self.answered {
            return;
        }
        self.answered = true;
        self.shared.send(Message::ChannelOpenFailure {
            recipient: self.remote_id,
            reason,
            description: description.to_string(),
        });
    }
}

impl Drop for ChannelRequest {
    fn drop(&mut self) {
        self.send_failure(
            OpenFailureReason::AdministrativelyProhibited,
            "channel request dropped",
        );
    }
}

impl std::fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("channel_type", &self.channel_type)
            .field("remote_id", &self.remote_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signer;
    use crate::session::handshake::{
        client_handshake, server_handshake, ClientConfig, ServerConfig, DEFAULT_USER,
    };
    use crate::session::policy::AllowAll;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn session_pair() -> (Arc<Session>, Arc<Session>, IncomingChannels) {
        let (a, b) = duplex(256 * 1024);
        let client = ClientConfig {
            signer: Signer::from_seed(&[1u8; 32]),
            verifier: Arc::new(AllowAll),
            host: "test".to_string(),
            user: DEFAULT_USER.to_string(),
        };
        let server = ServerConfig {
            signer: Signer::from_seed(&[2u8; 32]),
            authorizer: Arc::new(AllowAll),
        };

        let (c, s) = tokio::join!(client_handshake(a, &client), server_handshake(b, &server));
        let client_session = Session::client(c.unwrap());
        let (server_session, incoming) = Session::serve(s.unwrap());
        (client_session, server_session, incoming)
    }

    #[tokio::test]
    async fn test_open_accept_and_exchange() {
        let (client, server, mut incoming) = session_pair().await;
        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(server.peer_fingerprint(), Signer::from_seed(&[1u8; 32]).fingerprint());

        let server_task = tokio::spawn(async move {
            let request = incoming.next().await.unwrap();
            assert_eq!(request.channel_type(), "http");
            let mut channel = request.accept().unwrap();

            let mut buf = [0u8; 4];
            channel.read_exact(&mut buf).await.unwrap();
            channel.write_all(&buf).await.unwrap();
            channel.close();
            server
        });

        let mut channel = client.open_channel("http").await.unwrap();
        channel.write_all(b"ping").await.unwrap();

        let mut echoed = Vec::new();
        channel.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_open_reports_reason() {
        let (client, _server, mut incoming) = session_pair().await;

        let server_task = tokio::spawn(async move {
            let request = incoming.next().await.unwrap();
            request.reject(OpenFailureReason::UnknownChannelType, "unknown channel type");
            incoming
        });

        let err = client.open_channel("ftp").await.unwrap_err();
        assert_eq!(
            err,
            ChannelOpenError::Rejected {
                reason: OpenFailureReason::UnknownChannelType,
                description: "unknown channel type".to_string(),
            }
        );
        let _incoming = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_refuses_inbound_channels() {
        let (client, server, _incoming) = session_pair().await;

        let err = server.open_channel("http").await.unwrap_err();
        assert!(matches!(
            err,
            ChannelOpenError::Rejected {
                reason: OpenFailureReason::UnknownChannelType,
                ..
            }
        ));
        drop(client);
    }

    #[tokio::test]
    async fn test_disconnect_resets_open_channels() {
        let (client, server, mut incoming) = session_pair().await;

        let opener = tokio::spawn(async move {
            let channel = client.open_channel("http").await.unwrap();
            (client, channel)
        });
        let _accepted = incoming.next().await.unwrap().accept().unwrap();
        let (client, mut channel) = opener.await.unwrap();

        drop(server);
        drop(incoming);

        let mut buf = [0u8; 8];
        let err = channel.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert!(client.is_closed());
        assert_eq!(
            client.open_channel("http").await.unwrap_err(),
            ChannelOpenError::SessionClosed
        );
    }

    #[tokio::test]
    async fn test_full_backlog_delays_instead_of_rejecting() {
        let (client, _server, mut incoming) = session_pair().await;
        let total = INCOMING_BACKLOG + 8;

        let openers: Vec<_> = (0..total)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.open_channel("http").await })
            })
            .collect();

        // Nobody drains the queue yet, so the surplus must wait
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(openers.iter().all(|opener| !opener.is_finished()));

        let mut accepted = Vec::new();
        for _ in 0..total {
            accepted.push(incoming.next().await.unwrap().accept().unwrap());
        }
        for opener in openers {
            assert!(opener.await.unwrap().is_ok());
        }
        assert_eq!(accepted.len(), total);
    }

    #[tokio::test]
    async fn test_transfer_larger_than_window() {
        let (client, _server, mut incoming) = session_pair().await;
        let payload: Vec<u8> = (0..(INITIAL_WINDOW as usize * 2 + 12345))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();

        let reader = tokio::spawn(async move {
            let mut channel = incoming.next().await.unwrap().accept().unwrap();
            let mut received = Vec::new();
            channel.read_to_end(&mut received).await.unwrap();
            received
        });

        let mut channel = client.open_channel("http").await.unwrap();
        channel.write_all(&payload).await.unwrap();
        channel.shutdown().await.unwrap();

        assert_eq!(reader.await.unwrap(), expected);
    }
}
