//! Session-layer error types
//!
//! Split by stage so callers can tell where a session failed: packet I/O and
//! decoding ([`ProtocolError`]), the handshake ([`HandshakeError`]) and
//! channel negotiation ([`ChannelOpenError`]).

use std::io;

use thiserror::Error;

use super::codec::OpenFailureReason;
use crate::crypto::{CryptoError, Fingerprint};

/// Errors raised while reading, writing or decoding packets
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the raw connection
    #[error("Connection closed by peer")]
    Closed,

    /// Packet length exceeds the protocol limit
    #[error("Packet exceeds maximum size: {size} > {max}")]
    PacketTooLarge {
        /// Announced or produced size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Payload could not be decoded
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Message number is not part of the protocol
    #[error("Unknown message number: {0}")]
    UnknownMessage(u8),

    /// Version banner is missing or unsupported
    #[error("Invalid version banner: {0}")]
    Banner(String),

    /// Packet sealing or opening failed
    #[error("Packet crypto failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for packet operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while establishing an authenticated session
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Packet I/O or decoding failed mid-handshake
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No algorithm in a category is supported by both sides
    #[error("No common {category} algorithm")]
    NoCommonAlgorithm {
        /// Algorithm category (kex, host key, cipher)
        category: &'static str,
    },

    /// Peer sent a message out of sequence
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Message the handshake was waiting for
        expected: &'static str,
        /// Message actually received
        actual: &'static str,
    },

    /// Key material in the exchange was invalid
    #[error("Key exchange failed: {0}")]
    KeyExchange(#[from] CryptoError),

    /// Host key signature over the exchange hash did not verify
    #[error("Host key signature is invalid")]
    InvalidHostSignature,

    /// Host verifier refused the server's key
    #[error("Host key {0} rejected")]
    HostKeyRejected(Fingerprint),

    /// Client's authentication signature did not verify
    #[error("Client signature is invalid")]
    InvalidClientSignature,

    /// Peer authorizer refused the client's key
    #[error("Client key {0} rejected")]
    ClientRejected(Fingerprint),

    /// Server refused our client authentication
    #[error("Authentication rejected by server")]
    AuthenticationRejected,

    /// Peer sent DISCONNECT during the handshake
    #[error("Peer disconnected: {0}")]
    Disconnected(String),

    /// Handshake did not finish in time
    #[error("Handshake timed out")]
    Timeout,
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Errors raised while opening or accepting a logical channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenError {
    /// Peer refused the channel
    #[error("Channel rejected ({reason}): {description}")]
    Rejected {
        /// Reason code sent by the peer
        reason: OpenFailureReason,
        /// Human-readable description sent by the peer
        description: String,
    },

    /// Session ended before the channel could be established
    #[error("Session closed")]
    SessionClosed,
}
