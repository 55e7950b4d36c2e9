//! Authenticated, encrypted, multiplexed sessions
//!
//! This module turns a raw byte stream into a [`Session`]:
//! - `packet` and `codec`: framing and SSH-style messages
//! - `handshake`: key exchange, host key proof and client authentication
//! - `mux` and `channel`: background reader/writer tasks and logical channels
//! - `policy`: pluggable trust decisions on peer keys
//!
//! # Design
//!
//! The handshake runs inline on the caller's task. Once it succeeds the
//! session owns two tasks, so channels never touch the socket directly and
//! one slow channel cannot stall the others beyond its own window.

mod channel;
pub mod codec;
mod error;
pub mod handshake;
mod mux;
pub mod packet;
pub mod policy;

pub(crate) use channel::lock;
pub use channel::{Channel, ChannelCloser, INITIAL_WINDOW, MAX_DATA_PER_PACKET};
pub use codec::{Message, OpenFailureReason};
pub use error::{ChannelOpenError, HandshakeError, HandshakeResult, ProtocolError, ProtocolResult};
pub use handshake::{client_handshake, server_handshake, ClientConfig, Established, ServerConfig};
pub use mux::{ChannelRequest, IncomingChannels, Session, INCOMING_BACKLOG};
pub use policy::{AllowAll, FingerprintAllowList, HostVerifier, PeerAuthorizer};
