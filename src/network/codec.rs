use std::io::{Error, ErrorKind};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Constants for message size management
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB - prevent DoS attacks

/// Serialize with size limit
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let encoded = bincode::serialize(value)
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("Serialization error: {}", e)))?;

    if encoded.len() > MAX_MESSAGE_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Serialized message size {} exceeds maximum", encoded.len()),
        ));
    }

    Ok(encoded)
}

/// Deserialize with validation
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::new(ErrorKind::InvalidData, "Message size exceeds limit"));
    }

    bincode::deserialize(bytes)
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("Deserialization error: {}", e)))
}

/// Write one frame: 4-byte big-endian length prefix + bincode payload
pub async fn write_frame<W, T>(io: &mut W, value: &T) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(value)?;

    let len = bytes.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&bytes).await?;
    io.flush().await
}

/// Read one frame. Returns `None` when the peer closed the stream cleanly
/// before a new frame started.
pub async fn read_frame<R, T>(io: &mut R) -> Result<Option<T>, Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // Read 4-byte length prefix to know exact message size
    let mut len_bytes = [0u8; 4];
    match io.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Message size {} exceeds maximum {}", len, MAX_MESSAGE_SIZE),
        ));
    }

    if len == 0 {
        return Err(Error::new(ErrorKind::InvalidData, "Message size cannot be zero"));
    }

    let mut buffer = vec![0u8; len];
    io.read_exact(&mut buffer).await?;

    decode(&buffer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::rpc::{RaftMessage, RequestVoteRequest};

    #[tokio::test]
    async fn test_frames_over_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let message = RaftMessage::RequestVote(RequestVoteRequest {
            term: 3,
            candidate_id: 1,
            last_log_index: 7,
            last_log_term: 2,
        });
        write_frame(&mut client, &message).await.unwrap();
        write_frame(&mut client, &RaftMessage::Status).await.unwrap();
        drop(client);

        let first: Option<RaftMessage> = read_frame(&mut server).await.unwrap();
        assert_eq!(first, Some(message));
        let second: Option<RaftMessage> = read_frame(&mut server).await.unwrap();
        assert_eq!(second, Some(RaftMessage::Status));
        let end: Option<RaftMessage> = read_frame(&mut server).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let result: Result<Option<RaftMessage>, Error> = read_frame(&mut server).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidData);
    }
}
