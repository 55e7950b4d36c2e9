//! Secure channel listener
//!
//! Lifecycle: [`Listener::setup`] binds, [`Listener::accept`] runs the accept
//! loop, [`Listener::close`] stops it. Every raw connection gets its own task
//! that runs the handshake and then hands accepted channels to the handler one
//! at a time.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connection::Connection;
use super::ListenError;
use crate::config::{
    ListenSettings, DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_CHANNEL_TYPE,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::crypto::Signer;
use crate::session::{
    lock, server_handshake, AllowAll, FingerprintAllowList, HandshakeError, OpenFailureReason,
    PeerAuthorizer, ServerConfig, Session,
};

/// What happens to a session after one of its channel requests is rejected
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRejectPolicy {
    /// Keep serving later requests on the same session
    #[default]
    Continue,
    /// Stop serving the session
    Disconnect,
}

/// Bounds for the delay between failed accepts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Delay never grows beyond this
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl Backoff {
    /// Delay following `current`
    pub fn next(&self, current: Option<Duration>) -> Duration {
        match current {
            None => self.initial,
            Some(delay) => (delay * 2).min(self.max),
        }
    }
}

/// Listener configuration
#[derive(Clone)]
pub struct ListenOptions {
    /// Socket address to bind, e.g. `127.0.0.1:8080`
    pub address: String,
    /// Host credential presented to clients
    pub identity: Signer,
    /// Channel type names accepted
    pub channel_types: HashSet<String>,
    /// Bound on each server-side handshake
    pub handshake_timeout: Duration,
    /// Bound on each handler invocation
    pub channel_timeout: Option<Duration>,
    /// Delay between failed accepts
    pub backoff: Backoff,
    /// Session treatment after a rejected channel
    pub reject_policy: ChannelRejectPolicy,
    /// Decides which client keys get in
    pub authorizer: Arc<dyn PeerAuthorizer>,
}

impl ListenOptions {
    /// Options with defaults: accept `"http"` channels from any client key
    pub fn new(address: impl Into<String>, identity: Signer) -> Self {
        ListenOptions {
            address: address.into(),
            identity,
            channel_types: HashSet::from([DEFAULT_CHANNEL_TYPE.to_string()]),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            channel_timeout: None,
            backoff: Backoff::default(),
            reject_policy: ChannelRejectPolicy::default(),
            authorizer: Arc::new(AllowAll),
        }
    }

    /// Replace the accepted channel types
    pub fn channel_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the handshake bound
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the handler bound
    pub fn channel_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.channel_timeout = timeout;
        self
    }

    /// Set the accept backoff
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the reject policy
    pub fn reject_policy(mut self, policy: ChannelRejectPolicy) -> Self {
        self.reject_policy = policy;
        self
    }

    /// Set the client key authorizer
    pub fn authorizer(mut self, authorizer: Arc<dyn PeerAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Apply file-based settings
    pub fn with_settings(self, settings: &ListenSettings) -> Self {
        let options = self
            .channel_types(settings.channel_types.iter().cloned())
            .handshake_timeout(settings.handshake_timeout())
            .channel_timeout(settings.channel_timeout())
            .backoff(Backoff {
                initial: Duration::from_millis(settings.accept_backoff_initial_ms),
                max: Duration::from_millis(settings.accept_backoff_max_ms),
            })
            .reject_policy(settings.reject_policy);

        if settings.authorized_keys.is_empty() {
            options
        } else {
            options.authorizer(Arc::new(FingerprintAllowList::new(
                settings.authorized_keys.iter().copied(),
            )))
        }
    }
}

impl std::fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenOptions")
            .field("address", &self.address)
            .field("identity", &self.identity)
            .field("channel_types", &self.channel_types)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("channel_timeout", &self.channel_timeout)
            .field("reject_policy", &self.reject_policy)
            .finish_non_exhaustive()
    }
}

/// Receives each accepted channel
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve one connection; the listener closes it after this returns
    async fn handle(&self, conn: Connection);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, conn: Connection) {
        (self)(conn).await
    }
}

/// Listener lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    /// Socket bound, accept loop not running
    Bound,
    /// Accept loop running
    Accepting,
    /// Closed for good
    Closed,
}

/// Source of raw connections for the accept loop
#[async_trait]
trait Acceptor: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        let _ = stream.set_nodelay(true);
        Ok((stream, peer))
    }
}

/// Read-only state shared with every connection task
struct Shared {
    server: ServerConfig,
    channel_types: HashSet<String>,
    handshake_timeout: Duration,
    channel_timeout: Option<Duration>,
    reject_policy: ChannelRejectPolicy,
    handler: Arc<dyn Handler>,
}

/// Accepts raw connections and turns them into authenticated sessions
pub struct Listener {
    socket: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    state: Mutex<ListenerState>,
    backoff: Backoff,
    shared: Arc<Shared>,
}

impl Listener {
    /// Bind the socket and prepare the handshake configuration
    pub async fn setup<H>(options: ListenOptions, handler: H) -> Result<Listener, ListenError>
    where
        H: Handler,
    {
        let socket = TcpListener::bind(&options.address)
            .await
            .map_err(|source| ListenError::Bind {
                address: options.address.clone(),
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| ListenError::Bind {
            address: options.address.clone(),
            source,
        })?;

        info!(
            address = %local_addr,
            host_key = %options.identity.fingerprint(),
            "Listener bound"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Listener {
            socket: tokio::sync::Mutex::new(Some(socket)),
            local_addr,
            shutdown,
            state: Mutex::new(ListenerState::Bound),
            backoff: options.backoff,
            shared: Arc::new(Shared {
                server: ServerConfig {
                    signer: options.identity,
                    authorizer: options.authorizer,
                },
                channel_types: options.channel_types,
                handshake_timeout: options.handshake_timeout,
                channel_timeout: options.channel_timeout,
                reject_policy: options.reject_policy,
                handler: Arc::new(handler),
            }),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ListenerState) {
        let mut state = lock(&self.state);
        if *state != ListenerState::Closed {
            *state = next;
        }
    }

    /// Run the accept loop until [`Listener::close`] is called
    ///
    /// Accept errors are logged and retried after a backoff. Returns
    /// immediately if the listener is already closed or another accept loop
    /// is running.
    pub async fn accept(&self) -> Result<(), ListenError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut guard = match self.socket.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(ListenError::AlreadyAccepting),
        };
        let socket = match guard.as_ref() {
            Some(socket) => socket,
            None => return Ok(()),
        };

        self.set_state(ListenerState::Accepting);
        info!(address = %self.local_addr, "Accepting connections");

        self.accept_loop(socket, &mut shutdown).await;

        // Release the port as soon as the loop stops
        guard.take();
        self.set_state(ListenerState::Closed);
        info!(address = %self.local_addr, "Listener closed");
        Ok(())
    }

    /// Hand every accepted connection to its own task until shutdown
    ///
    /// Failed accepts are retried after a delay that grows per failure and
    /// starts over after a success. Shutdown also cuts the delay short.
    async fn accept_loop<A: Acceptor>(&self, acceptor: &A, shutdown: &mut watch::Receiver<bool>) {
        let mut delay: Option<Duration> = None;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = acceptor.accept() => match accepted {
                    Ok((stream, peer)) => {
                        delay = None;
                        let shared = self.shared.clone();
                        let span = info_span!("connection", peer = %peer);
                        tokio::spawn(serve_connection(stream, shared).instrument(span));
                    }
                    Err(e) => {
                        let wait = self.backoff.next(delay);
                        delay = Some(wait);
                        warn!(error = %e, retry_in = ?wait, "Accept failed");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                },
            }
        }
    }

    /// Stop accepting and release the socket
    ///
    /// In-flight connections keep running. Calling this again does nothing.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        *lock(&self.state) = ListenerState::Closed;

        // Not accepting: drop the socket here, otherwise the loop drops it
        if let Ok(mut socket) = self.socket.try_lock() {
            socket.take();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Handshake, then serve channel requests until the session ends
async fn serve_connection<S>(stream: S, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let handshake = tokio::time::timeout(
        shared.handshake_timeout,
        server_handshake(stream, &shared.server),
    )
    .await
    .unwrap_or(Err(HandshakeError::Timeout));

    let established = match handshake {
        Ok(established) => established,
        Err(e) => {
            debug!(error = %e, "Handshake failed");
            return;
        }
    };

    let (session, mut incoming) = Session::serve(established);
    debug!(pubkey_fp = %session.peer_fingerprint(), "Session established");

    while let Some(request) = incoming.next().await {
        if !shared.channel_types.contains(request.channel_type()) {
            debug!(channel_type = %request.channel_type(), "Rejecting channel");
            request.reject(OpenFailureReason::UnknownChannelType, "unknown channel type");
            match shared.reject_policy {
                ChannelRejectPolicy::Continue => continue,
                ChannelRejectPolicy::Disconnect => break,
            }
        }

        let channel = match request.accept() {
            Ok(channel) => channel,
            Err(e) => {
                debug!(error = %e, "Channel accept failed");
                break;
            }
        };

        let conn = Connection::new(channel, session.clone());
        let closer = conn.closer();
        let handled = shared.handler.handle(conn);
        match shared.channel_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, handled).await.is_err() {
                    debug!(timeout = ?limit, "Handler timed out");
                }
            }
            None => handled.await,
        }
        closer.close();
    }

    debug!("Session finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    /// Plays back a fixed list of accept results, then waits forever
    struct ScriptedAcceptor {
        script: Mutex<VecDeque<io::Result<()>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedAcceptor {
        fn new(script: Vec<io::Result<()>>) -> Arc<Self> {
            Arc::new(ScriptedAcceptor {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            lock(&self.calls).len()
        }

        fn gaps_ms(&self) -> Vec<u128> {
            lock(&self.calls)
                .windows(2)
                .map(|w| (w[1] - w[0]).as_millis())
                .collect()
        }
    }

    #[async_trait]
    impl Acceptor for ScriptedAcceptor {
        type Stream = DuplexStream;

        async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
            lock(&self.calls).push(Instant::now());
            let next = lock(&self.script).pop_front();
            match next {
                Some(Ok(())) => {
                    // Far end already dropped: the handshake fails straight away
                    let (stream, _) = tokio::io::duplex(1024);
                    Ok((stream, SocketAddr::from(([127, 0, 0, 1], 1))))
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    fn aborted() -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::ConnectionAborted))
    }

    async fn listener_with(backoff: Backoff) -> Arc<Listener> {
        let options =
            ListenOptions::new("127.0.0.1:0", Signer::from_seed(&[1u8; 32])).backoff(backoff);
        let idle = |_conn: Connection| async {};
        Arc::new(Listener::setup(options, idle).await.unwrap())
    }

    fn run_loop(
        listener: &Arc<Listener>,
        acceptor: &Arc<ScriptedAcceptor>,
    ) -> tokio::task::JoinHandle<()> {
        let mut shutdown = listener.shutdown.subscribe();
        let (listener, acceptor) = (listener.clone(), acceptor.clone());
        tokio::spawn(async move { listener.accept_loop(&*acceptor, &mut shutdown).await })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        let mut delay = None;
        let mut seen = Vec::new();
        for _ in 0..10 {
            let next = backoff.next(delay);
            seen.push(next);
            delay = Some(next);
        }

        assert_eq!(seen[0], Duration::from_millis(5));
        assert_eq!(seen[1], Duration::from_millis(10));
        assert_eq!(seen[2], Duration::from_millis(20));
        assert_eq!(*seen.last().unwrap(), Duration::from_secs(1));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_options_from_settings() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let settings = ListenSettings {
            channel_types: vec!["http".to_string(), "admin".to_string()],
            channel_timeout_ms: 100,
            reject_policy: ChannelRejectPolicy::Disconnect,
            ..ListenSettings::default()
        };

        let options = ListenOptions::new("127.0.0.1:0", signer).with_settings(&settings);
        assert!(options.channel_types.contains("admin"));
        assert_eq!(options.channel_timeout, Some(Duration::from_millis(100)));
        assert_eq!(options.reject_policy, ChannelRejectPolicy::Disconnect);
    }

    #[tokio::test]
    async fn test_bind_error() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let idle = |_conn: Connection| async {};
        let first = Listener::setup(ListenOptions::new("127.0.0.1:0", signer.clone()), idle)
            .await
            .unwrap();

        let taken = first.local_addr().to_string();
        let err = Listener::setup(ListenOptions::new(taken.clone(), signer), idle)
            .await
            .unwrap_err();
        assert!(matches!(err, ListenError::Bind { address, .. } if address == taken));
    }

    #[tokio::test]
    async fn test_close_before_accept() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let idle = |_conn: Connection| async {};
        let listener = Listener::setup(ListenOptions::new("127.0.0.1:0", signer), idle)
            .await
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Bound);

        listener.close();
        listener.close();
        assert_eq!(listener.state(), ListenerState::Closed);
        assert!(listener.accept().await.is_ok());

        // Port is free again
        let rebound = TcpListener::bind(listener.local_addr()).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off_and_reset_after_success() {
        let listener = listener_with(Backoff::default()).await;
        let acceptor =
            ScriptedAcceptor::new(vec![aborted(), aborted(), aborted(), Ok(()), aborted()]);
        let running = run_loop(&listener, &acceptor);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(acceptor.calls(), 6);
        assert_eq!(acceptor.gaps_ms(), vec![5, 10, 20, 0, 5]);

        listener.close();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_backoff_sleep() {
        let slow = Backoff {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(60),
        };
        let listener = listener_with(slow).await;
        let acceptor = ScriptedAcceptor::new(vec![aborted(), aborted()]);
        let running = run_loop(&listener, &acceptor);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(acceptor.calls(), 1);

        let closed_at = Instant::now();
        listener.close();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();

        assert!(closed_at.elapsed() < Duration::from_secs(1));
        assert_eq!(acceptor.calls(), 1);
    }
}
