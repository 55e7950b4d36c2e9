//! SSH-style message codec
//!
//! Payloads start with a one-byte message number followed by fields in SSH
//! encoding: big-endian `u32`, length-prefixed strings and comma-separated
//! name-lists.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{ProtocolError, ProtocolResult};

/// Message numbers
pub mod msg {
    #![allow(missing_docs)]
    pub const DISCONNECT: u8 = 1;
    pub const IGNORE: u8 = 2;
    pub const KEXINIT: u8 = 20;
    pub const NEWKEYS: u8 = 21;
    pub const KEX_ECDH_INIT: u8 = 30;
    pub const KEX_ECDH_REPLY: u8 = 31;
    pub const USERAUTH_REQUEST: u8 = 50;
    pub const USERAUTH_FAILURE: u8 = 51;
    pub const USERAUTH_SUCCESS: u8 = 52;
    pub const GLOBAL_REQUEST: u8 = 80;
    pub const REQUEST_SUCCESS: u8 = 81;
    pub const REQUEST_FAILURE: u8 = 82;
    pub const CHANNEL_OPEN: u8 = 90;
    pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
    pub const CHANNEL_OPEN_FAILURE: u8 = 92;
    pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
    pub const CHANNEL_DATA: u8 = 94;
    pub const CHANNEL_EOF: u8 = 96;
    pub const CHANNEL_CLOSE: u8 = 97;
}

/// DISCONNECT reason: protocol error
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;
/// DISCONNECT reason: key exchange failed
pub const DISCONNECT_KEY_EXCHANGE_FAILED: u32 = 3;
/// DISCONNECT reason: application closed the session
pub const DISCONNECT_BY_APPLICATION: u32 = 11;
/// DISCONNECT reason: authentication refused
pub const DISCONNECT_NO_MORE_AUTH_METHODS: u32 = 14;

/// Reason code carried by CHANNEL_OPEN_FAILURE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenFailureReason {
    /// Policy refused the channel
    AdministrativelyProhibited,
    /// Target could not be reached
    ConnectFailed,
    /// Channel type name is not accepted
    UnknownChannelType,
    /// Peer is out of resources
    ResourceShortage,
    /// Any code outside the SSH-defined range
    Other(u32),
}

impl OpenFailureReason {
    /// Wire code
    pub fn code(self) -> u32 {
        match self {
            OpenFailureReason::AdministrativelyProhibited => 1,
            OpenFailureReason::ConnectFailed => 2,
            OpenFailureReason::UnknownChannelType => 3,
            OpenFailureReason::ResourceShortage => 4,
            OpenFailureReason::Other(code) => code,
        }
    }
}

impl From<u32> for OpenFailureReason {
    fn from(code: u32) -> Self {
        match code {
            1 => OpenFailureReason::AdministrativelyProhibited,
            2 => OpenFailureReason::ConnectFailed,
            3 => OpenFailureReason::UnknownChannelType,
            4 => OpenFailureReason::ResourceShortage,
            other => OpenFailureReason::Other(other),
        }
    }
}

impl std::fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenFailureReason::AdministrativelyProhibited => {
                write!(f, "administratively prohibited")
            }
            OpenFailureReason::ConnectFailed => write!(f, "connect failed"),
            OpenFailureReason::UnknownChannelType => write!(f, "unknown channel type"),
            OpenFailureReason::ResourceShortage => write!(f, "resource shortage"),
            OpenFailureReason::Other(code) => write!(f, "reason {}", code),
        }
    }
}

/// Algorithm negotiation offer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie making each offer unique
    pub cookie: [u8; 16],
    /// Key exchange algorithms in preference order
    pub kex_algorithms: Vec<String>,
    /// Host key algorithms in preference order
    pub host_key_algorithms: Vec<String>,
    /// Packet cipher algorithms in preference order
    pub ciphers: Vec<String>,
}

/// A protocol message
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message {
    Disconnect {
        reason: u32,
        description: String,
    },
    Ignore,
    KexInit(KexInit),
    NewKeys,
    KexEcdhInit {
        ephemeral: Bytes,
    },
    KexEcdhReply {
        host_key: Bytes,
        ephemeral: Bytes,
        signature: Bytes,
    },
    UserauthRequest {
        user: String,
        service: String,
        algorithm: String,
        public_key: Bytes,
        signature: Bytes,
    },
    UserauthFailure,
    UserauthSuccess,
    GlobalRequest {
        name: String,
        want_reply: bool,
        data: Bytes,
    },
    RequestSuccess,
    RequestFailure,
    ChannelOpen {
        channel_type: String,
        sender: u32,
        window: u32,
        max_packet: u32,
    },
    ChannelOpenConfirmation {
        recipient: u32,
        sender: u32,
        window: u32,
        max_packet: u32,
    },
    ChannelOpenFailure {
        recipient: u32,
        reason: OpenFailureReason,
        description: String,
    },
    ChannelWindowAdjust {
        recipient: u32,
        bytes: u32,
    },
    ChannelData {
        recipient: u32,
        data: Bytes,
    },
    ChannelEof {
        recipient: u32,
    },
    ChannelClose {
        recipient: u32,
    },
}

impl Message {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Message::Disconnect { .. } => "DISCONNECT",
            Message::Ignore => "IGNORE",
            Message::KexInit(_) => "KEXINIT",
            Message::NewKeys => "NEWKEYS",
            Message::KexEcdhInit { .. } => "KEX_ECDH_INIT",
            Message::KexEcdhReply { .. } => "KEX_ECDH_REPLY",
            Message::UserauthRequest { .. } => "USERAUTH_REQUEST",
            Message::UserauthFailure => "USERAUTH_FAILURE",
            Message::UserauthSuccess => "USERAUTH_SUCCESS",
            Message::GlobalRequest { .. } => "GLOBAL_REQUEST",
            Message::RequestSuccess => "REQUEST_SUCCESS",
            Message::RequestFailure => "REQUEST_FAILURE",
            Message::ChannelOpen { .. } => "CHANNEL_OPEN",
            Message::ChannelOpenConfirmation { .. } => "CHANNEL_OPEN_CONFIRMATION",
            Message::ChannelOpenFailure { .. } => "CHANNEL_OPEN_FAILURE",
            Message::ChannelWindowAdjust { .. } => "CHANNEL_WINDOW_ADJUST",
            Message::ChannelData { .. } => "CHANNEL_DATA",
            Message::ChannelEof { .. } => "CHANNEL_EOF",
            Message::ChannelClose { .. } => "CHANNEL_CLOSE",
        }
    }

    /// Serialize message to a payload
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::Disconnect {
                reason,
                description,
            } => {
                buf.put_u8(msg::DISCONNECT);
                buf.put_u32(*reason);
                put_string(&mut buf, description.as_bytes());
                put_string(&mut buf, b"");
            }
            Message::Ignore => {
                buf.put_u8(msg::IGNORE);
                put_string(&mut buf, b"");
            }
            Message::KexInit(kex) => {
                buf.put_u8(msg::KEXINIT);
                buf.put_slice(&kex.cookie);
                put_name_list(&mut buf, &kex.kex_algorithms);
                put_name_list(&mut buf, &kex.host_key_algorithms);
                put_name_list(&mut buf, &kex.ciphers);
                buf.put_u8(0); // first_kex_packet_follows
                buf.put_u32(0); // reserved
            }
            Message::NewKeys => buf.put_u8(msg::NEWKEYS),
            Message::KexEcdhInit { ephemeral } => {
                buf.put_u8(msg::KEX_ECDH_INIT);
                put_string(&mut buf, ephemeral);
            }
            Message::KexEcdhReply {
                host_key,
                ephemeral,
                signature,
            } => {
                buf.put_u8(msg::KEX_ECDH_REPLY);
                put_string(&mut buf, host_key);
                put_string(&mut buf, ephemeral);
                put_string(&mut buf, signature);
            }
            Message::UserauthRequest {
                user,
                service,
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_u8(msg::USERAUTH_REQUEST);
                put_string(&mut buf, user.as_bytes());
                put_string(&mut buf, service.as_bytes());
                put_string(&mut buf, b"publickey");
                buf.put_u8(1);
                put_string(&mut buf, algorithm.as_bytes());
                put_string(&mut buf, public_key);
                put_string(&mut buf, signature);
            }
            Message::UserauthFailure => {
                buf.put_u8(msg::USERAUTH_FAILURE);
                put_name_list(&mut buf, &["publickey".to_string()]);
                buf.put_u8(0);
            }
            Message::UserauthSuccess => buf.put_u8(msg::USERAUTH_SUCCESS),
            Message::GlobalRequest {
                name,
                want_reply,
                data,
            } => {
                buf.put_u8(msg::GLOBAL_REQUEST);
                put_string(&mut buf, name.as_bytes());
                buf.put_u8(u8::from(*want_reply));
                buf.put_slice(data);
            }
            Message::RequestSuccess => buf.put_u8(msg::REQUEST_SUCCESS),
            Message::RequestFailure => buf.put_u8(msg::REQUEST_FAILURE),
            Message::ChannelOpen {
                channel_type,
                sender,
                window,
                max_packet,
            } => {
                buf.put_u8(msg::CHANNEL_OPEN);
                put_string(&mut buf, channel_type.as_bytes());
                buf.put_u32(*sender);
                buf.put_u32(*window);
                buf.put_u32(*max_packet);
            }
            Message::ChannelOpenConfirmation {
                recipient,
                sender,
                window,
                max_packet,
            } => {
                buf.put_u8(msg::CHANNEL_OPEN_CONFIRMATION);
                buf.put_u32(*recipient);
                buf.put_u32(*sender);
                buf.put_u32(*window);
                buf.put_u32(*max_packet);
            }
            Message::ChannelOpenFailure {
                recipient,
                reason,
                description,
            } => {
                buf.put_u8(msg::CHANNEL_OPEN_FAILURE);
                buf.put_u32(*recipient);
                buf.put_u32(reason.code());
                put_string(&mut buf, description.as_bytes());
                put_string(&mut buf, b"");
            }
            Message::ChannelWindowAdjust { recipient, bytes } => {
                buf.put_u8(msg::CHANNEL_WINDOW_ADJUST);
                buf.put_u32(*recipient);
                buf.put_u32(*bytes);
            }
            Message::ChannelData { recipient, data } => {
                buf.put_u8(msg::CHANNEL_DATA);
                buf.put_u32(*recipient);
                put_string(&mut buf, data);
            }
            Message::ChannelEof { recipient } => {
                buf.put_u8(msg::CHANNEL_EOF);
                buf.put_u32(*recipient);
            }
            Message::ChannelClose { recipient } => {
                buf.put_u8(msg::CHANNEL_CLOSE);
                buf.put_u32(*recipient);
            }
        }

        buf.freeze()
    }

    /// Deserialize message from a payload
    pub fn from_bytes(payload: &[u8]) -> ProtocolResult<Self> {
        let mut r = Reader::new(payload);
        let number = r.u8()?;

        let message = match number {
            msg::DISCONNECT => {
                let reason = r.u32()?;
                let description = r.utf8()?;
                Message::Disconnect {
                    reason,
                    description,
                }
            }
            msg::IGNORE => Message::Ignore,
            msg::KEXINIT => {
                let mut cookie = [0u8; 16];
                cookie.copy_from_slice(r.take(16)?);
                Message::KexInit(KexInit {
                    cookie,
                    kex_algorithms: r.name_list()?,
                    host_key_algorithms: r.name_list()?,
                    ciphers: r.name_list()?,
                })
            }
            msg::NEWKEYS => Message::NewKeys,
            msg::KEX_ECDH_INIT => Message::KexEcdhInit {
                ephemeral: r.string()?,
            },
            msg::KEX_ECDH_REPLY => Message::KexEcdhReply {
                host_key: r.string()?,
                ephemeral: r.string()?,
                signature: r.string()?,
            },
            msg::USERAUTH_REQUEST => {
                let user = r.utf8()?;
                let service = r.utf8()?;
                let method = r.utf8()?;
                if method != "publickey" {
                    return Err(ProtocolError::Malformed(format!(
                        "unsupported auth method: {}",
                        method
                    )));
                }
                if !r.bool()? {
                    return Err(ProtocolError::Malformed(
                        "public key query without signature".to_string(),
                    ));
                }
                Message::UserauthRequest {
                    user,
                    service,
                    algorithm: r.utf8()?,
                    public_key: r.string()?,
                    signature: r.string()?,
                }
            }
            msg::USERAUTH_FAILURE => Message::UserauthFailure,
            msg::USERAUTH_SUCCESS => Message::UserauthSuccess,
            msg::GLOBAL_REQUEST => Message::GlobalRequest {
                name: r.utf8()?,
                want_reply: r.bool()?,
                data: r.rest(),
            },
            msg::REQUEST_SUCCESS => Message::RequestSuccess,
            msg::REQUEST_FAILURE => Message::RequestFailure,
            msg::CHANNEL_OPEN => Message::ChannelOpen {
                channel_type: r.utf8()?,
                sender: r.u32()?,
                window: r.u32()?,
                max_packet: r.u32()?,
            },
            msg::CHANNEL_OPEN_CONFIRMATION => Message::ChannelOpenConfirmation {
                recipient: r.u32()?,
                sender: r.u32()?,
                window: r.u32()?,
                max_packet: r.u32()?,
            },
            msg::CHANNEL_OPEN_FAILURE => Message::ChannelOpenFailure {
                recipient: r.u32()?,
                reason: OpenFailureReason::from(r.u32()?),
                description: r.utf8()?,
            },
            msg::CHANNEL_WINDOW_ADJUST => Message::ChannelWindowAdjust {
                recipient: r.u32()?,
                bytes: r.u32()?,
            },
            msg::CHANNEL_DATA => Message::ChannelData {
                recipient: r.u32()?,
                data: r.string()?,
            },
            msg::CHANNEL_EOF => Message::ChannelEof {
                recipient: r.u32()?,
            },
            msg::CHANNEL_CLOSE => Message::ChannelClose {
                recipient: r.u32()?,
            },
            other => return Err(ProtocolError::UnknownMessage(other)),
        };

        Ok(message)
    }
}

/// Append an SSH string: `u32 length || bytes`
pub fn put_string(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Append an SSH name-list
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, names.join(",").as_bytes());
}

/// Bounds-checked cursor over a payload
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn need(&self, n: usize) -> ProtocolResult<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Malformed(format!(
                "needed {} bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> ProtocolResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> ProtocolResult<bool> {
        Ok(self.u8()? != 0)
    }

    fn u32(&mut self) -> ProtocolResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn take(&mut self, n: usize) -> ProtocolResult<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> ProtocolResult<Bytes> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn utf8(&mut self) -> ProtocolResult<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    fn name_list(&mut self) -> ProtocolResult<Vec<String>> {
        let joined = self.utf8()?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split(',').map(str::to_string).collect())
    }

    fn rest(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.buf);
        self.buf = &[];
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_messages_use_ssh_numbers() {
        let open = Message::ChannelOpen {
            channel_type: "http".to_string(),
            sender: 7,
            window: 2 * 1024 * 1024,
            max_packet: 32 * 1024,
        }
        .to_bytes();

        assert_eq!(open[0], 90);
        assert_eq!(&open[1..5], &4u32.to_be_bytes());
        assert_eq!(&open[5..9], b"http");
        assert_eq!(&open[9..13], &7u32.to_be_bytes());
    }

    #[test]
    fn test_kexinit_roundtrip() {
        let kex = Message::KexInit(KexInit {
            cookie: [3u8; 16],
            kex_algorithms: vec!["a".to_string(), "b".to_string()],
            host_key_algorithms: vec!["ssh-ed25519".to_string()],
            ciphers: Vec::new(),
        });

        let parsed = Message::from_bytes(&kex.to_bytes()).unwrap();
        assert_eq!(parsed, kex);
    }

    #[test]
    fn test_channel_data_and_failure_roundtrip() {
        let messages = vec![
            Message::ChannelData {
                recipient: 1,
                data: Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n"),
            },
            Message::ChannelOpenFailure {
                recipient: 2,
                reason: OpenFailureReason::UnknownChannelType,
                description: "unknown channel type".to_string(),
            },
            Message::UserauthRequest {
                user: "shttp".to_string(),
                service: "shttp-connection".to_string(),
                algorithm: "ssh-ed25519".to_string(),
                public_key: Bytes::from_static(&[1, 2, 3]),
                signature: Bytes::from_static(&[4, 5, 6]),
            },
            Message::GlobalRequest {
                name: "keepalive@openssh.com".to_string(),
                want_reply: true,
                data: Bytes::new(),
            },
        ];

        for message in messages {
            assert_eq!(Message::from_bytes(&message.to_bytes()).unwrap(), message);
        }
    }

    #[test]
    fn test_open_failure_reason_codes() {
        assert_eq!(OpenFailureReason::UnknownChannelType.code(), 3);
        assert_eq!(OpenFailureReason::from(3), OpenFailureReason::UnknownChannelType);
        assert_eq!(OpenFailureReason::from(99), OpenFailureReason::Other(99));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let data = Message::ChannelData {
            recipient: 1,
            data: Bytes::from_static(b"hello"),
        }
        .to_bytes();

        let err = Message::from_bytes(&data[..data.len() - 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_empty_and_unknown_payloads_rejected() {
        assert!(matches!(
            Message::from_bytes(&[]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Message::from_bytes(&[200]),
            Err(ProtocolError::UnknownMessage(200))
        ));
    }
}
