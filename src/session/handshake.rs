//! Session handshake
//!
//! Both sides run the same sequence over a fresh raw connection:
//!
//! ```text
//! Client                                   Server
//!   |  ---- version banner ------------->     |
//!   |  <--- version banner --------------     |
//!   |  ---- KEXINIT -------------------->     |
//!   |  <--- KEXINIT ---------------------     |
//!   |  ---- KEX_ECDH_INIT (Q_C) -------->     |
//!   |  <--- KEX_ECDH_REPLY (K_S, Q_S, sig)    |   sig = Sign(host, H)
//!   |  <--> NEWKEYS <------------------->     |   packets sealed from here
//!   |  ---- USERAUTH_REQUEST (key, sig) ->    |   sig = Sign(client, auth blob)
//!   |  <--- USERAUTH_SUCCESS ------------     |
//! ```
//!
//! `H` binds both banners, both KEXINIT payloads, the host key and both
//! ephemeral keys to the shared secret, and doubles as the session id.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::codec::{
    put_string, KexInit, Message, DISCONNECT_KEY_EXCHANGE_FAILED, DISCONNECT_NO_MORE_AUTH_METHODS,
};
use super::error::{HandshakeError, HandshakeResult};
use super::packet::{ensure_shttp_peer, PacketReader, PacketWriter, LOCAL_VERSION};
use super::policy::{HostVerifier, PeerAuthorizer};
use crate::crypto::identity::KEY_ALGORITHM;
use crate::crypto::{
    random_bytes, EphemeralKeypair, ExchangePublicKey, Fingerprint, Hash, PublicKey,
    SessionKeys, SignatureBytes, Signer,
};

/// Key exchange algorithm name
pub const KEX_ALGORITHM: &str = "curve25519-blake3@shttp";

/// Packet cipher algorithm name
pub const CIPHER_ALGORITHM: &str = "chacha20-poly1305@shttp";

/// Service requested during client authentication
pub const SERVICE_NAME: &str = "shttp-connection";

/// User name sent when the caller does not pick one
pub const DEFAULT_USER: &str = "shttp";

/// Size of the session id
pub const SESSION_ID_SIZE: usize = 32;

/// Client-side handshake parameters
#[derive(Clone)]
pub struct ClientConfig {
    /// Client credential
    pub signer: Signer,
    /// Decides whether the server's host key is acceptable
    pub verifier: Arc<dyn HostVerifier>,
    /// Host name passed to the verifier
    pub host: String,
    /// User name sent with the authentication request
    pub user: String,
}

/// Server-side handshake parameters
#[derive(Clone)]
pub struct ServerConfig {
    /// Host credential
    pub signer: Signer,
    /// Decides whether a client key is let in
    pub authorizer: Arc<dyn PeerAuthorizer>,
}

/// Result of a successful handshake: a keyed packet stream and the peer's key
pub struct Established {
    /// Decrypting half
    pub reader: PacketReader,
    /// Encrypting half
    pub writer: PacketWriter,
    /// Exchange hash of the first key exchange
    pub session_id: [u8; SESSION_ID_SIZE],
    /// Authenticated public key of the peer
    pub peer_key: PublicKey,
}

impl Established {
    /// Fingerprint of the peer's key
    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.peer_key.fingerprint()
    }
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("session_id", &hex::encode(&self.session_id[..8]))
            .field("peer", &self.peer_fingerprint())
            .finish_non_exhaustive()
    }
}

fn local_kexinit() -> KexInit {
    KexInit {
        cookie: random_bytes(),
        kex_algorithms: vec![KEX_ALGORITHM.to_string()],
        host_key_algorithms: vec![KEY_ALGORITHM.to_string()],
        ciphers: vec![CIPHER_ALGORITHM.to_string()],
    }
}

/// Pick the first client algorithm the server also offers
fn negotiate(
    client: &[String],
    server: &[String],
    category: &'static str,
) -> HandshakeResult<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or(HandshakeError::NoCommonAlgorithm { category })
}

fn negotiate_all(client: &KexInit, server: &KexInit) -> HandshakeResult<()> {
    negotiate(&client.kex_algorithms, &server.kex_algorithms, "kex")?;
    negotiate(
        &client.host_key_algorithms,
        &server.host_key_algorithms,
        "host key",
    )?;
    negotiate(&client.ciphers, &server.ciphers, "cipher")?;
    Ok(())
}

fn unexpected(expected: &'static str, actual: Message) -> HandshakeError {
    match actual {
        Message::Disconnect { description, .. } => HandshakeError::Disconnected(description),
        other => HandshakeError::UnexpectedMessage {
            expected,
            actual: other.name(),
        },
    }
}

/// Read the peer's KEXINIT, keeping its raw payload for the exchange hash
async fn read_kexinit(reader: &mut PacketReader) -> HandshakeResult<(Bytes, KexInit)> {
    loop {
        let payload = reader.read_payload().await?;
        match Message::from_bytes(&payload)? {
            Message::Ignore => continue,
            Message::KexInit(kex) => return Ok((payload, kex)),
            other => return Err(unexpected("KEXINIT", other)),
        }
    }
}

async fn expect_newkeys(reader: &mut PacketReader) -> HandshakeResult<()> {
    match reader.read_message().await? {
        Message::NewKeys => Ok(()),
        other => Err(unexpected("NEWKEYS", other)),
    }
}

/// Transcript pieces hashed into `H`
struct Transcript<'a> {
    client_version: &'a str,
    server_version: &'a str,
    client_kexinit: &'a [u8],
    server_kexinit: &'a [u8],
    host_key: &'a [u8],
    client_ephemeral: &'a [u8],
    server_ephemeral: &'a [u8],
    shared_secret: &'a [u8],
}

impl Transcript<'_> {
    fn exchange_hash(&self) -> [u8; SESSION_ID_SIZE] {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.client_version.as_bytes());
        put_string(&mut buf, self.server_version.as_bytes());
        put_string(&mut buf, self.client_kexinit);
        put_string(&mut buf, self.server_kexinit);
        put_string(&mut buf, self.host_key);
        put_string(&mut buf, self.client_ephemeral);
        put_string(&mut buf, self.server_ephemeral);
        put_string(&mut buf, self.shared_secret);
        let hash = Hash::hash(&buf);
        zeroize::Zeroize::zeroize(&mut buf[..]);
        hash
    }
}

/// Bytes the client signs to prove possession of its key
fn auth_blob(session_id: &[u8], user: &str, algorithm: &str, public_key: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    put_string(&mut buf, session_id);
    buf.put_u8(super::codec::msg::USERAUTH_REQUEST);
    put_string(&mut buf, user.as_bytes());
    put_string(&mut buf, SERVICE_NAME.as_bytes());
    put_string(&mut buf, b"publickey");
    buf.put_u8(1);
    put_string(&mut buf, algorithm.as_bytes());
    put_string(&mut buf, public_key);
    buf
}

async fn send_disconnect(writer: &mut PacketWriter, reason: u32, description: &str) {
    let message = Message::Disconnect {
        reason,
        description: description.to_string(),
    };
    // The peer may already be gone
    let _ = writer.write_message(&message).await;
}

/// Run the client side of the handshake over `stream`
pub async fn client_handshake<S>(stream: S, config: &ClientConfig) -> HandshakeResult<Established>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);

    writer.write_version(LOCAL_VERSION).await?;
    let server_version = reader.read_version().await?;
    ensure_shttp_peer(&server_version)?;
    debug!(version = %server_version, "Server version received");

    let ours = local_kexinit();
    let client_kexinit = Message::KexInit(ours.clone()).to_bytes();
    writer.write_payload(&client_kexinit).await?;
    let (server_kexinit, theirs) = read_kexinit(&mut reader).await?;
    negotiate_all(&ours, &theirs)?;

    let ephemeral = EphemeralKeypair::generate();
    writer
        .write_message(&Message::KexEcdhInit {
            ephemeral: Bytes::copy_from_slice(ephemeral.public_key().as_bytes()),
        })
        .await?;

    let (host_blob, server_ephemeral, signature) = match reader.read_message().await? {
        Message::KexEcdhReply {
            host_key,
            ephemeral,
            signature,
        } => (host_key, ephemeral, signature),
        other => return Err(unexpected("KEX_ECDH_REPLY", other)),
    };

    let host_key = PublicKey::from_ssh_blob(&host_blob)?;
    let shared = ephemeral.diffie_hellman(&ExchangePublicKey::from_bytes(&server_ephemeral)?);
    shared.ensure_contributory()?;

    let session_id = Transcript {
        client_version: LOCAL_VERSION,
        server_version: &server_version,
        client_kexinit: &client_kexinit,
        server_kexinit: &server_kexinit,
        host_key: &host_blob,
        client_ephemeral: ephemeral.public_key().as_bytes(),
        server_ephemeral: &server_ephemeral,
        shared_secret: shared.as_bytes(),
    }
    .exchange_hash();

    let signature =
        SignatureBytes::from_bytes(&signature).map_err(|_| HandshakeError::InvalidHostSignature)?;
    host_key
        .verify(&session_id, &signature)
        .map_err(|_| HandshakeError::InvalidHostSignature)?;

    let host_fingerprint = host_key.fingerprint();
    if !config.verifier.verify(&config.host, &host_fingerprint) {
        send_disconnect(&mut writer, DISCONNECT_KEY_EXCHANGE_FAILED, "host key rejected").await;
        return Err(HandshakeError::HostKeyRejected(host_fingerprint));
    }

    writer.write_message(&Message::NewKeys).await?;
    expect_newkeys(&mut reader).await?;

    let keys = SessionKeys::derive(&shared, &session_id);
    writer.enable_encryption(&keys.client_to_server);
    reader.enable_decryption(&keys.server_to_client);

    let public_blob = config.signer.public_key().to_ssh_blob();
    let signature = config.signer.sign(&auth_blob(
        &session_id,
        &config.user,
        KEY_ALGORITHM,
        &public_blob,
    ));
    writer
        .write_message(&Message::UserauthRequest {
            user: config.user.clone(),
            service: SERVICE_NAME.to_string(),
            algorithm: KEY_ALGORITHM.to_string(),
            public_key: Bytes::from(public_blob),
            signature: Bytes::copy_from_slice(signature.as_bytes()),
        })
        .await?;

    match reader.read_message().await? {
        Message::UserauthSuccess => {}
        Message::UserauthFailure => return Err(HandshakeError::AuthenticationRejected),
        other => return Err(unexpected("USERAUTH_SUCCESS", other)),
    }

    debug!(host = %config.host, host_key = %host_fingerprint, "Client handshake complete");

    Ok(Established {
        reader,
        writer,
        session_id,
        peer_key: host_key,
    })
}

/// Run the server side of the handshake over `stream`
pub async fn server_handshake<S>(stream: S, config: &ServerConfig) -> HandshakeResult<Established>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);

    writer.write_version(LOCAL_VERSION).await?;
    let client_version = reader.read_version().await?;
    ensure_shttp_peer(&client_version)?;
    debug!(version = %client_version, "Client version received");

    let ours = local_kexinit();
    let server_kexinit = Message::KexInit(ours.clone()).to_bytes();
    writer.write_payload(&server_kexinit).await?;
    let (client_kexinit, theirs) = read_kexinit(&mut reader).await?;
    if let Err(e) = negotiate_all(&theirs, &ours) {
        send_disconnect(&mut writer, DISCONNECT_KEY_EXCHANGE_FAILED, "no common algorithm").await;
        return Err(e);
    }

    let client_ephemeral = match reader.read_message().await? {
        Message::KexEcdhInit { ephemeral } => ephemeral,
        other => return Err(unexpected("KEX_ECDH_INIT", other)),
    };

    let ephemeral = EphemeralKeypair::generate();
    let shared = ephemeral.diffie_hellman(&ExchangePublicKey::from_bytes(&client_ephemeral)?);
    shared.ensure_contributory()?;

    let host_blob = config.signer.public_key().to_ssh_blob();
    let session_id = Transcript {
        client_version: &client_version,
        server_version: LOCAL_VERSION,
        client_kexinit: &client_kexinit,
        server_kexinit: &server_kexinit,
        host_key: &host_blob,
        client_ephemeral: &client_ephemeral,
        server_ephemeral: ephemeral.public_key().as_bytes(),
        shared_secret: shared.as_bytes(),
    }
    .exchange_hash();

    let signature = config.signer.sign(&session_id);
    writer
        .write_message(&Message::KexEcdhReply {
            host_key: Bytes::from(host_blob),
            ephemeral: Bytes::copy_from_slice(ephemeral.public_key().as_bytes()),
            signature: Bytes::copy_from_slice(signature.as_bytes()),
        })
        .await?;

    writer.write_message(&Message::NewKeys).await?;
    expect_newkeys(&mut reader).await?;

    let keys = SessionKeys::derive(&shared, &session_id);
    writer.enable_encryption(&keys.server_to_client);
    reader.enable_decryption(&keys.client_to_server);

    let (user, service, algorithm, public_blob, signature) = match reader.read_message().await? {
        Message::UserauthRequest {
            user,
            service,
            algorithm,
            public_key,
            signature,
        } => (user, service, algorithm, public_key, signature),
        other => return Err(unexpected("USERAUTH_REQUEST", other)),
    };

    let verified = verify_client(
        &session_id,
        &user,
        &service,
        &algorithm,
        &public_blob,
        &signature,
    );
    let client_key = match verified {
        Some(key) => key,
        None => {
            writer.write_message(&Message::UserauthFailure).await?;
            return Err(HandshakeError::InvalidClientSignature);
        }
    };

    let fingerprint = client_key.fingerprint();
    if !config.authorizer.authorize(&fingerprint) {
        writer.write_message(&Message::UserauthFailure).await?;
        send_disconnect(&mut writer, DISCONNECT_NO_MORE_AUTH_METHODS, "client key rejected").await;
        return Err(HandshakeError::ClientRejected(fingerprint));
    }

    writer.write_message(&Message::UserauthSuccess).await?;
    debug!(user = %user, pubkey_fp = %fingerprint, "Client authenticated");

    Ok(Established {
        reader,
        writer,
        session_id,
        peer_key: client_key,
    })
}

fn verify_client(
    session_id: &[u8],
    user: &str,
    service: &str,
    algorithm: &str,
    public_blob: &[u8],
    signature: &[u8],
) -> Option<PublicKey> {
    if service != SERVICE_NAME || algorithm != KEY_ALGORITHM {
        return None;
    }
    let key = PublicKey::from_ssh_blob(public_blob).ok()?;
    let signature = SignatureBytes::from_bytes(signature).ok()?;
    key.verify(&auth_blob(session_id, user, algorithm, public_blob), &signature)
        .ok()?;
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::error::ProtocolError;
    use crate::session::policy::{AllowAll, FingerprintAllowList};
    use tokio::io::{duplex, AsyncWriteExt};

    fn client_config(seed: u8, verifier: Arc<dyn HostVerifier>) -> ClientConfig {
        ClientConfig {
            signer: Signer::from_seed(&[seed; 32]),
            verifier,
            host: "test-host".to_string(),
            user: DEFAULT_USER.to_string(),
        }
    }

    fn server_config(seed: u8, authorizer: Arc<dyn PeerAuthorizer>) -> ServerConfig {
        ServerConfig {
            signer: Signer::from_seed(&[seed; 32]),
            authorizer,
        }
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (a, b) = duplex(64 * 1024);
        let client = client_config(1, Arc::new(AllowAll));
        let server = server_config(2, Arc::new(AllowAll));

        let (client_result, server_result) =
            tokio::join!(client_handshake(a, &client), server_handshake(b, &server));
        let mut client_side = client_result.unwrap();
        let mut server_side = server_result.unwrap();

        assert_eq!(client_side.session_id, server_side.session_id);
        assert_eq!(client_side.peer_key, *server.signer.public_key());
        assert_eq!(server_side.peer_key, *client.signer.public_key());

        // Keys are active in both directions
        let message = Message::ChannelEof { recipient: 3 };
        client_side.writer.write_message(&message).await.unwrap();
        assert_eq!(server_side.reader.read_message().await.unwrap(), message);
        server_side.writer.write_message(&message).await.unwrap();
        assert_eq!(client_side.reader.read_message().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_host_key_rejected() {
        let (a, b) = duplex(64 * 1024);
        let other = Signer::from_seed(&[9u8; 32]).fingerprint();
        let client = client_config(1, Arc::new(FingerprintAllowList::new([other])));
        let server = server_config(2, Arc::new(AllowAll));

        let (client_result, server_result) =
            tokio::join!(client_handshake(a, &client), server_handshake(b, &server));

        let expected = server.signer.fingerprint();
        assert!(matches!(
            client_result,
            Err(HandshakeError::HostKeyRejected(fp)) if fp == expected
        ));
        assert!(server_result.is_err());
    }

    #[tokio::test]
    async fn test_client_key_rejected() {
        let (a, b) = duplex(64 * 1024);
        let client = client_config(1, Arc::new(AllowAll));
        let server = server_config(2, Arc::new(FingerprintAllowList::default()));

        let (client_result, server_result) =
            tokio::join!(client_handshake(a, &client), server_handshake(b, &server));

        assert!(matches!(
            client_result,
            Err(HandshakeError::AuthenticationRejected)
        ));
        let expected = client.signer.fingerprint();
        assert!(matches!(
            server_result,
            Err(HandshakeError::ClientRejected(fp)) if fp == expected
        ));
    }

    #[tokio::test]
    async fn test_allowed_client_key_accepted() {
        let (a, b) = duplex(64 * 1024);
        let client = client_config(1, Arc::new(AllowAll));
        let server = server_config(
            2,
            Arc::new(FingerprintAllowList::new([client.signer.fingerprint()])),
        );

        let (client_result, server_result) =
            tokio::join!(client_handshake(a, &client), server_handshake(b, &server));
        assert!(client_result.is_ok());
        assert!(server_result.is_ok());
    }

    #[tokio::test]
    async fn test_garbage_peer_fails_handshake() {
        let (mut a, b) = duplex(64 * 1024);
        let server = server_config(2, Arc::new(AllowAll));

        a.write_all(b"SSH-2.0-garbage\r\n\x00\x00\x00\x05\x63junk").await.unwrap();
        drop(a);

        assert!(server_handshake(b, &server).await.is_err());
    }

    #[tokio::test]
    async fn test_stock_ssh_client_refused_at_banner() {
        let (mut a, b) = duplex(64 * 1024);
        let server = server_config(2, Arc::new(AllowAll));

        a.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();

        assert!(matches!(
            server_handshake(b, &server).await,
            Err(HandshakeError::Protocol(ProtocolError::Banner(_)))
        ));
    }

    #[test]
    fn test_negotiate_picks_first_client_choice() {
        let client = vec!["b".to_string(), "a".to_string()];
        let server = vec!["a".to_string(), "b".to_string()];
        assert_eq!(negotiate(&client, &server, "kex").unwrap(), "b");
        assert!(matches!(
            negotiate(&client, &["c".to_string()], "cipher"),
            Err(HandshakeError::NoCommonAlgorithm { category: "cipher" })
        ));
    }
}
