//! Memcached binary protocol, just enough of it to pull `STAT` dumps
//!
//! Every packet starts with a 24-byte header:
//!
//! ```text
//! magic | opcode | key len (u16) | extras len | data type | vbucket/status (u16)
//! total body len (u32) | opaque (u32) | cas (u64)
//! ```
//!
//! followed by extras, key and value. A `STAT` request is answered by one
//! packet per statistic and terminated by a packet with an empty key.

use super::{ClientError, NodeStats};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Size of a packet header
pub const HEADER_LEN: usize = 24;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

/// Refuse bodies above this size instead of allocating for a corrupt length
const MAX_BODY_LEN: usize = 20 * 1024 * 1024;

/// Opcodes used by the stats fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Stat = 0x10,
    SaslAuth = 0x21,
    SelectBucket = 0x89,
}

/// A decoded or to-be-encoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: u8,
    pub opcode: u8,
    /// vbucket id in requests, status code in responses
    pub status: u16,
    pub opaque: u32,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    /// Build a request packet without extras
    pub fn request(
        opcode: Opcode,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        opaque: u32,
    ) -> Self {
        Self {
            magic: MAGIC_REQUEST,
            opcode: opcode as u8,
            status: 0,
            opaque,
            extras: Bytes::new(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Build a response packet (used by tests and fakes)
    pub fn response(
        opcode: Opcode,
        status: u16,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        opaque: u32,
    ) -> Self {
        Self {
            magic: MAGIC_RESPONSE,
            opcode: opcode as u8,
            status,
            opaque,
            extras: Bytes::new(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serialize header and body
    pub fn encode(&self, buf: &mut BytesMut) {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        buf.reserve(HEADER_LEN + body_len);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0);
        buf.put_u16(self.status);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(0);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }

    /// Decode one complete packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, String> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = buf[0];
        if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
            return Err(format!("bad magic byte 0x{:02x}", magic));
        }

        let key_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let extras_len = buf[4] as usize;
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;

        if body_len > MAX_BODY_LEN {
            return Err(format!("body length {} exceeds limit", body_len));
        }
        if key_len + extras_len > body_len {
            return Err(format!(
                "key ({}) and extras ({}) overflow body ({})",
                key_len, extras_len, body_len
            ));
        }
        if buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }

        let mut header = buf.split_to(HEADER_LEN);
        let mut body = buf.split_to(body_len);

        header.advance(1);
        let opcode = header.get_u8();
        header.advance(4);
        let status = header.get_u16();
        header.advance(4);
        let opaque = header.get_u32();

        let extras = body.split_to(extras_len).freeze();
        let key = body.split_to(key_len).freeze();
        let value = body.freeze();

        Ok(Some(Self {
            magic,
            opcode,
            status,
            opaque,
            extras,
            key,
            value,
        }))
    }
}

/// SASL PLAIN credentials for the data port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn plain_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        payload.push(0);
        payload.extend_from_slice(self.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.password.as_bytes());
        payload
    }
}

/// A framed connection to one data port
struct Connection {
    addr: String,
    stream: TcpStream,
    buf: BytesMut,
    opaque: u32,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(|source| ClientError::Io {
            addr: addr.to_string(),
            source,
        })?;

        Ok(Self {
            addr: addr.to_string(),
            stream,
            buf: BytesMut::with_capacity(4096),
            opaque: 0,
        })
    }

    async fn send(&mut self, opcode: Opcode, key: &[u8], value: &[u8]) -> Result<u32, ClientError> {
        self.opaque = self.opaque.wrapping_add(1);
        let packet = Packet::request(
            opcode,
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            self.opaque,
        );

        let mut out = BytesMut::new();
        packet.encode(&mut out);
        self.stream
            .write_all(&out)
            .await
            .map_err(|source| ClientError::Io {
                addr: self.addr.clone(),
                source,
            })?;

        Ok(self.opaque)
    }

    async fn recv(&mut self) -> Result<Packet, ClientError> {
        loop {
            let decoded = Packet::decode(&mut self.buf).map_err(|message| ClientError::Protocol {
                addr: self.addr.clone(),
                message,
            })?;
            if let Some(packet) = decoded {
                if packet.magic != MAGIC_RESPONSE {
                    return Err(ClientError::Protocol {
                        addr: self.addr.clone(),
                        message: "expected a response packet".to_string(),
                    });
                }
                return Ok(packet);
            }

            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|source| ClientError::Io {
                    addr: self.addr.clone(),
                    source,
                })?;
            if n == 0 {
                return Err(ClientError::Protocol {
                    addr: self.addr.clone(),
                    message: "connection closed mid-response".to_string(),
                });
            }
        }
    }

    fn status_message(packet: &Packet) -> String {
        format!(
            "status 0x{:04x}: {}",
            packet.status,
            String::from_utf8_lossy(&packet.value)
        )
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), ClientError> {
        self.send(Opcode::SaslAuth, b"PLAIN", &credentials.plain_payload())
            .await?;
        let reply = self.recv().await?;
        if reply.status != 0 {
            return Err(ClientError::Auth {
                addr: self.addr.clone(),
                message: Self::status_message(&reply),
            });
        }
        Ok(())
    }

    async fn select_bucket(&mut self, bucket: &str) -> Result<(), ClientError> {
        self.send(Opcode::SelectBucket, bucket.as_bytes(), b"").await?;
        let reply = self.recv().await?;
        if reply.status != 0 {
            return Err(ClientError::Auth {
                addr: self.addr.clone(),
                message: format!("select bucket {}: {}", bucket, Self::status_message(&reply)),
            });
        }
        Ok(())
    }

    async fn stats(&mut self, which: &str) -> Result<NodeStats, ClientError> {
        let opaque = self.send(Opcode::Stat, which.as_bytes(), b"").await?;
        let mut stats = NodeStats::new();

        loop {
            let packet = self.recv().await?;
            if packet.opaque != opaque {
                debug!(addr = %self.addr, opaque = packet.opaque, "Skipping stray packet");
                continue;
            }
            if packet.status != 0 {
                return Err(ClientError::Protocol {
                    addr: self.addr.clone(),
                    message: Self::status_message(&packet),
                });
            }
            if packet.key.is_empty() {
                return Ok(stats);
            }

            stats.insert(
                String::from_utf8_lossy(&packet.key).into_owned(),
                String::from_utf8_lossy(&packet.value).into_owned(),
            );
        }
    }
}

/// Fetch the `STAT` group `which` ("" for the default dump) of `bucket`
/// from the data port at `addr`.
///
/// With cluster credentials the session authenticates as that user and then
/// selects the bucket; without them it authenticates as the bucket itself
/// with an empty password.
pub async fn fetch_stats(
    addr: &str,
    bucket: &str,
    credentials: Option<&Credentials>,
    which: &str,
) -> Result<NodeStats, ClientError> {
    let mut conn = Connection::open(addr).await?;

    match credentials {
        Some(credentials) => {
            conn.authenticate(credentials).await?;
            conn.select_bucket(bucket).await?;
        }
        None => {
            let bucket_auth = Credentials {
                username: bucket.to_string(),
                password: String::new(),
            };
            conn.authenticate(&bucket_auth).await?;
        }
    }

    conn.stats(which).await
}
