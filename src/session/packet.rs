//! Packet framing
//!
//! Every packet is `u32 length || body`. Until keys are activated the body is
//! the raw payload; afterwards it is the sealed payload, with the length
//! prefix authenticated as associated data.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::codec::Message;
use super::error::{ProtocolError, ProtocolResult};
use crate::crypto::cipher::{KEY_SIZE, TAG_SIZE};
use crate::crypto::PacketCipher;

/// Version banner sent by this implementation
///
/// Only the banner follows SSH. KEXINIT carries just the lists shttp
/// negotiates and packets have no padding, so the wire does not interoperate
/// with stock SSH software; see [`ensure_shttp_peer`].
pub const LOCAL_VERSION: &str = concat!("SSH-2.0-shttp_", env!("CARGO_PKG_VERSION"));

/// Banner prefix shared by every shttp endpoint
pub const SHTTP_VERSION_PREFIX: &str = "SSH-2.0-shttp_";

/// Largest packet body accepted or produced
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

const MAX_BANNER_LINE: usize = 255;
const MAX_PRE_BANNER_LINES: usize = 32;
const VERSION_PREFIX: &str = "SSH-2.0-";

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn map_eof(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Closed
    } else {
        ProtocolError::Io(err)
    }
}

/// Refuse a peer whose banner names software other than shttp
pub fn ensure_shttp_peer(version: &str) -> ProtocolResult<()> {
    if version.starts_with(SHTTP_VERSION_PREFIX) {
        Ok(())
    } else {
        Err(ProtocolError::Banner(format!(
            "peer is not an shttp endpoint: {}",
            version
        )))
    }
}

/// Inbound half of a packet stream
pub struct PacketReader {
    inner: BufReader<BoxedReader>,
    cipher: Option<PacketCipher>,
}

impl PacketReader {
    /// Wrap the read half of a raw connection
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        PacketReader {
            inner: BufReader::new(Box::new(reader) as BoxedReader),
            cipher: None,
        }
    }

    /// Read the peer's version banner, skipping any preamble lines
    pub async fn read_version(&mut self) -> ProtocolResult<String> {
        for _ in 0..=MAX_PRE_BANNER_LINES {
            let mut line = Vec::new();
            let read = (&mut self.inner)
                .take(MAX_BANNER_LINE as u64 + 1)
                .read_until(b'\n', &mut line)
                .await?;

            if read == 0 {
                return Err(ProtocolError::Closed);
            }
            if line.last() != Some(&b'\n') {
                return Err(ProtocolError::Banner("line too long".to_string()));
            }

            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)
                .map_err(|_| ProtocolError::Banner("not UTF-8".to_string()))?;

            if line.starts_with(VERSION_PREFIX) {
                return Ok(line);
            }
            if line.starts_with("SSH-") {
                return Err(ProtocolError::Banner(format!("unsupported version: {}", line)));
            }
        }

        Err(ProtocolError::Banner("no version line".to_string()))
    }

    /// Read one packet and return its decrypted payload
    pub async fn read_payload(&mut self) -> ProtocolResult<Bytes> {
        let mut len_bytes = [0u8; 4];
        self.inner
            .read_exact(&mut len_bytes)
            .await
            .map_err(map_eof)?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: len,
                max: MAX_PACKET_SIZE,
            });
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await.map_err(map_eof)?;

        let payload = match self.cipher.as_mut() {
            Some(cipher) => cipher.open(&body, &len_bytes)?,
            None => body,
        };

        if payload.is_empty() {
            return Err(ProtocolError::Malformed("empty packet".to_string()));
        }

        Ok(Bytes::from(payload))
    }

    /// Read and decode the next message, dropping IGNORE packets
    pub async fn read_message(&mut self) -> ProtocolResult<Message> {
        loop {
            let payload = self.read_payload().await?;
            match Message::from_bytes(&payload)? {
                Message::Ignore => continue,
                message => return Ok(message),
            }
        }
    }

    /// Decrypt every following packet with `key`
    pub fn enable_decryption(&mut self, key: &[u8; KEY_SIZE]) {
        self.cipher = Some(PacketCipher::new(key));
    }
}

/// Outbound half of a packet stream
pub struct PacketWriter {
    inner: BoxedWriter,
    cipher: Option<PacketCipher>,
}

impl PacketWriter {
    /// Wrap the write half of a raw connection
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        PacketWriter {
            inner: Box::new(writer),
            cipher: None,
        }
    }

    /// Send our version banner
    pub async fn write_version(&mut self, version: &str) -> ProtocolResult<()> {
        self.inner.write_all(version.as_bytes()).await?;
        self.inner.write_all(b"\r\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Frame, seal and send one payload
    pub async fn write_payload(&mut self, payload: &[u8]) -> ProtocolResult<()> {
        let body_len = match self.cipher {
            Some(_) => payload.len() + TAG_SIZE,
            None => payload.len(),
        };
        if body_len > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: body_len,
                max: MAX_PACKET_SIZE,
            });
        }

        let len_bytes = (body_len as u32).to_be_bytes();
        let mut frame = BytesMut::with_capacity(4 + body_len);
        frame.put_slice(&len_bytes);

        match self.cipher.as_mut() {
            Some(cipher) => frame.put_slice(&cipher.seal(payload, &len_bytes)?),
            None => frame.put_slice(payload),
        }

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encode and send a message
    pub async fn write_message(&mut self, message: &Message) -> ProtocolResult<()> {
        self.write_payload(&message.to_bytes()).await
    }

    /// Encrypt every following packet with `key`
    pub fn enable_encryption(&mut self, key: &[u8; KEY_SIZE]) {
        self.cipher = Some(PacketCipher::new(key));
    }

    /// Flush and close the write half
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (PacketWriter, PacketReader) {
        let (a, b) = duplex(64 * 1024);
        let (_, a_write) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);
        (PacketWriter::new(a_write), PacketReader::new(b_read))
    }

    #[tokio::test]
    async fn test_version_exchange_skips_preamble() {
        let (a, b) = duplex(4096);
        let (_, mut raw) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);
        let mut reader = PacketReader::new(b_read);

        raw.write_all(b"welcome\r\nSSH-2.0-other_1.0\r\n").await.unwrap();

        assert_eq!(reader.read_version().await.unwrap(), "SSH-2.0-other_1.0");
    }

    #[test]
    fn test_only_shttp_peers_accepted() {
        assert!(LOCAL_VERSION.starts_with(SHTTP_VERSION_PREFIX));
        assert!(ensure_shttp_peer(LOCAL_VERSION).is_ok());
        assert!(ensure_shttp_peer("SSH-2.0-shttp_0.9.0").is_ok());
        assert!(matches!(
            ensure_shttp_peer("SSH-2.0-OpenSSH_9.6"),
            Err(ProtocolError::Banner(_))
        ));
    }

    #[tokio::test]
    async fn test_old_version_rejected() {
        let (a, b) = duplex(4096);
        let (_, mut raw) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);
        let mut reader = PacketReader::new(b_read);

        raw.write_all(b"SSH-1.5-legacy\r\n").await.unwrap();

        assert!(matches!(
            reader.read_version().await,
            Err(ProtocolError::Banner(_))
        ));
    }

    #[tokio::test]
    async fn test_overlong_banner_rejected() {
        let (a, b) = duplex(4096);
        let (_, mut raw) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);
        let mut reader = PacketReader::new(b_read);

        raw.write_all(&[b'x'; 400]).await.unwrap();

        assert!(matches!(
            reader.read_version().await,
            Err(ProtocolError::Banner(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_and_encrypted_packets() {
        let (mut writer, mut reader) = pair();

        writer.write_message(&Message::NewKeys).await.unwrap();
        assert_eq!(reader.read_message().await.unwrap(), Message::NewKeys);

        writer.enable_encryption(&[9u8; KEY_SIZE]);
        reader.enable_decryption(&[9u8; KEY_SIZE]);

        let message = Message::ChannelEof { recipient: 4 };
        writer.write_message(&Message::Ignore).await.unwrap();
        writer.write_message(&message).await.unwrap();
        assert_eq!(reader.read_message().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_key_mismatch_fails() {
        let (mut writer, mut reader) = pair();
        writer.enable_encryption(&[1u8; KEY_SIZE]);
        reader.enable_decryption(&[2u8; KEY_SIZE]);

        writer.write_message(&Message::NewKeys).await.unwrap();
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (a, b) = duplex(4096);
        let (_, mut raw) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);
        let mut reader = PacketReader::new(b_read);

        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        assert!(matches!(
            reader.read_payload().await,
            Err(ProtocolError::PacketTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let (a, b) = duplex(4096);
        let (b_read, _) = tokio::io::split(b);
        let mut reader = PacketReader::new(b_read);
        drop(a);

        assert!(matches!(
            reader.read_payload().await,
            Err(ProtocolError::Closed)
        ));
    }
}
