//! Length-prefixed `bincode` framing over an async byte stream.
//!
//! Every socket-shaped contract in this crate (PUB/SUB, REQ/REP, ROUTER)
//! sits on top of this framing: a 4-byte big-endian length prefix followed
//! by that many bytes of `bincode`-encoded payload. `bincode` needs no
//! code generation step, unlike a gRPC/protobuf path.

use crate::error::{Result, SpmError};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded frame size accepted by [`read_frame`]. Guards against a
/// corrupt or malicious length prefix causing an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Encode `value` and write it as a single length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        SpmError::Codec(Box::new(bincode::ErrorKind::SizeLimit))
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and decode it as `T`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(SpmError::Codec(Box::new(bincode::ErrorKind::SizeLimit)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let value = bincode::deserialize(&payload)?;
    Ok(value)
}

/// An envelope wraps a payload with the topic it was published under, the
/// way the pub/sub cache and router need to inspect the topic without
/// decoding the full payload type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope<T> {
    /// Topic string this message was published/addressed under.
    pub topic: String,
    /// The payload itself.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Build a new envelope.
    pub fn new(topic: impl Into<String>, payload: T) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Envelope::new("topic.a", 42u32)).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Envelope<u32> = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.topic, "topic.a");
        assert_eq!(decoded.payload, 42);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Envelope<u32>> = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
