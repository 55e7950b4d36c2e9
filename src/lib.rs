//! # shttp
//!
//! Authenticated, encrypted, multiplexed transport for request/response
//! protocols.
//!
//! ## Features
//!
//! - **Key-based identity**: Ed25519 keys, OpenSSH-style fingerprints
//! - **SSH-style sessions**: X25519 key exchange, ChaCha20-Poly1305 packets
//! - **Logical channels** with flow control, carried as plain byte streams
//! - **Pluggable trust**: allow any peer, or pin keys by fingerprint
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shttp::{dial, Connection, DialOptions, Identity, ListenOptions, Listener};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server_id = Identity::generate()?;
//! let listener = Listener::setup(
//!     ListenOptions::new("127.0.0.1:8080", server_id.signer()),
//!     |mut conn: Connection| async move {
//!         let _ = conn.write_all(b"hello").await;
//!     },
//! )
//! .await?;
//! tokio::spawn(async move { listener.accept().await });
//!
//! let client_id = Identity::generate()?;
//! let mut conn = dial(DialOptions::new("127.0.0.1:8080", client_id.signer())).await?;
//! let mut reply = Vec::new();
//! conn.read_to_end(&mut reply).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             APPLICATION PROTOCOL            │
//! │        HTTP-style request / response        │
//! └─────────────────────┬───────────────────────┘
//!                       │  Connection (bytes)
//! ┌─────────────────────▼───────────────────────┐
//! │              TRANSPORT LAYER                │
//! │      Listener  |  dial  |  Connection       │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               SESSION LAYER                 │
//! │  Handshake | Channels | Policy | Packets    │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │  Ed25519 | X25519 | ChaCha20-Poly1305 | BLAKE3
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use config::{ConfigError, DialSettings, ListenSettings, DEFAULT_CHANNEL_TYPE};
pub use crypto::{CryptoError, CryptoResult, Fingerprint, Identity, PublicKey, Signer};
pub use session::{AllowAll, FingerprintAllowList, HostVerifier, PeerAuthorizer};
pub use transport::{
    dial, ChannelRejectPolicy, Connection, DialError, DialOptions, Handler, ListenError,
    ListenOptions, Listener, Network,
};
