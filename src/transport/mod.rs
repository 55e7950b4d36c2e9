//! Transport layer
//!
//! This module puts sessions on real sockets:
//! - [`Listener`]: binds, handshakes every inbound connection, and hands each
//!   accepted channel to a [`Handler`]
//! - [`dial`]: connects, handshakes and opens one channel
//! - [`Connection`]: the byte stream both sides end up with
//!
//! # Design
//!
//! Failures are isolated per raw connection. A bad handshake or a rejected
//! channel only ever affects the connection it happened on; the only error a
//! listener reports to its owner is failing to bind.

use std::io;
use std::time::Duration;

use thiserror::Error;

mod connection;
mod dialer;
mod listener;

pub use connection::Connection;
pub use dialer::{dial, DialOptions, Network};
pub use listener::{
    Backoff, ChannelRejectPolicy, Handler, ListenOptions, Listener, ListenerState,
};

use crate::session::{ChannelOpenError, HandshakeError};

/// Errors raised while dialing
#[derive(Error, Debug)]
pub enum DialError {
    /// Network name is not `tcp`, `tcp4` or `tcp6`
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    /// Resolution or connect failed
    #[error("Connection failed: {0}")]
    Connect(#[source] io::Error),

    /// Address resolved to nothing usable for the network
    #[error("No {network} address for {address}")]
    NoAddress {
        /// Address as given
        address: String,
        /// Requested family
        network: Network,
    },

    /// Connect plus handshake ran past the deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Session could not be established
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Session is up but the channel was refused
    #[error("Channel open failed: {0}")]
    ChannelOpen(#[from] ChannelOpenError),
}

/// Errors raised by a listener
#[derive(Error, Debug)]
pub enum ListenError {
    /// Socket could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Address as given
        address: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Another task is already running the accept loop
    #[error("Accept loop already running")]
    AlreadyAccepting,
}
