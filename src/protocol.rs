use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ─── Wire constants ──────────────────────────────────────────────

/// `kind` (i32) + `producer_id` (i32) + `value` (f64), little-endian.
pub const REQUEST_LEN: usize = 16;

/// Longest reply text; the length prefix is a single byte.
pub const MAX_REPLY_LEN: usize = 127;

/// Tag producers write into `kind`. The server ignores it.
pub const KIND_READING: i32 = 1;

// ─── Messages ────────────────────────────────────────────────────

/// One reading sent by a producer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Request {
    pub kind: i32,
    pub producer_id: i32,
    pub value: f64,
}

/// Acknowledgement text sent back for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply(String);

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer closed the connection mid-frame")]
    Truncated,

    #[error("reply is not valid UTF-8")]
    InvalidReply,

    #[error("reply length {0} exceeds the 127-byte limit")]
    ReplyTooLong(usize),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Request {
    pub fn reading(producer_id: i32, value: f64) -> Self {
        Self {
            kind: KIND_READING,
            producer_id,
            value,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..8].copy_from_slice(&self.producer_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    /// Structural decoding only: any bit pattern is a valid value.
    pub fn decode(buf: &[u8; REQUEST_LEN]) -> Self {
        let mut kind = [0u8; 4];
        let mut pid = [0u8; 4];
        let mut value = [0u8; 8];
        kind.copy_from_slice(&buf[0..4]);
        pid.copy_from_slice(&buf[4..8]);
        value.copy_from_slice(&buf[8..16]);
        Self {
            kind: i32::from_le_bytes(kind),
            producer_id: i32::from_le_bytes(pid),
            value: f64::from_le_bytes(value),
        }
    }
}

impl Reply {
    /// `ACK: received <value> from pid <producer>`
    ///
    /// Huge magnitudes switch to exponent form so the producer id always
    /// fits within `MAX_REPLY_LEN`.
    pub fn ack(request: &Request) -> Self {
        let value = if request.value.abs() >= 1e15 && request.value.is_finite() {
            format!("{:.3e}", request.value)
        } else {
            format!("{:.3}", request.value)
        };
        Self::new(format!(
            "ACK: received {value} from pid {}",
            request.producer_id
        ))
    }

    /// Cut to `MAX_REPLY_LEN` bytes on a char boundary.
    pub fn new(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.len() > MAX_REPLY_LEN {
            let mut end = MAX_REPLY_LEN;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Framing ─────────────────────────────────────────────────────

/// Next request, or `None` when the peer hung up between frames.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; REQUEST_LEN];
    let mut filled = 0;
    while filled < REQUEST_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Truncated)
            };
        }
        filled += n;
    }
    Ok(Some(Request::decode(&buf)))
}

pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&request.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u8().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Truncated)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_REPLY_LEN {
        return Err(ProtocolError::ReplyTooLong(len));
    }

    let mut text = vec![0u8; len];
    reader.read_exact(&mut text).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            e.into()
        }
    })?;

    let text = String::from_utf8(text).map_err(|_| ProtocolError::InvalidReply)?;
    Ok(Reply(text))
}

pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = reply.0.as_bytes();
    // `Reply::new` keeps this within one byte.
    writer.write_u8(bytes.len() as u8).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
