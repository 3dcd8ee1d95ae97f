/// Wire protocol: frame tags, the transport record, and the application
/// message codec.
///
/// A connection carries two kinds of frames, distinguished by one leading
/// tag byte. `0x1` announces a discrete control message; `0x2` announces a
/// raw stream body that the decoder does not touch. Stream bodies carry
/// their own length out of band: either in the preceding `StoreFile`
/// message or as an `i64` little-endian prefix on a get response.
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::MeshResult;

/// Frame tag for a discrete control message.
pub const INCOMING_MESSAGE: u8 = 0x1;
/// Frame tag for a raw stream body.
pub const INCOMING_STREAM: u8 = 0x2;

/// A control message is read with a single read call of at most this many
/// bytes; longer payloads are silently truncated.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// One framed element as it comes off a connection.
#[derive(Debug, Clone, Default)]
pub struct Rpc {
    /// Remote address of the connection the frame arrived on.
    pub from: String,
    /// Message payload; empty for stream records.
    pub payload: Vec<u8>,
    /// True when the frame announces a raw stream body.
    pub stream: bool,
}

/// Logical messages exchanged between file servers.
///
/// The variant set is closed: both endpoints compile the same enum, which
/// is what keeps the binary encoding self-consistent across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// "I am about to send you `size` encrypted bytes for `key`."
    StoreFile { id: String, key: String, size: u64 },
    /// "Send me `key` if you have it."
    GetFile { id: String, key: String },
}

impl Message {
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(payload: &[u8]) -> MeshResult<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Frame decoding failures, as seen by the read loop.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The connection ended; the read loop exits gracefully.
    #[error("connection closed")]
    Closed,
    /// The leading byte was not a known frame tag.
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    /// The message payload could not be read.
    #[error("frame read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode one framed element from `reader` into `rpc`.
///
/// Stream frames consist of the tag alone; the body that follows belongs
/// to whoever solicited it and is never consumed here. Message frames are
/// read with a single read call, which assumes the sender issued the whole
/// message as one write.
pub async fn decode_frame<R>(reader: &mut R, rpc: &mut Rpc) -> Result<(), DecodeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    // Any failure to produce the tag byte means the connection is gone.
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(_) => return Err(DecodeError::Closed),
    };

    match tag {
        INCOMING_STREAM => {
            rpc.stream = true;
            rpc.payload.clear();
            Ok(())
        }
        INCOMING_MESSAGE => {
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(DecodeError::Closed);
            }
            buf.truncate(n);
            rpc.stream = false;
            rpc.payload = buf;
            Ok(())
        }
        other => Err(DecodeError::UnknownTag(other)),
    }
}
