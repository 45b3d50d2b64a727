//! Wire protocol I/O
//!
//! Async helpers that move handshakes and length-prefixed frames over a stream.

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Largest frame we accept: a 16 KiB block plus generous headroom for
/// bitfields of very large torrents and extension payloads
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Read a complete message from the stream
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let length = reader.read_u32().await? as usize;
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    if length > MAX_FRAME_LEN {
        return Err(TorrentError::protocol_with_detail(
            "Frame exceeds maximum length",
            format!("{} > {}", length, MAX_FRAME_LEN),
        )
        .into());
    }

    let mut body = BytesMut::zeroed(length);
    reader.read_exact(&mut body).await?;
    Message::decode_body(body.freeze())
}

/// Write a message to the stream
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a handshake from the stream
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await?;
    Handshake::deserialize(&buf)
}

/// Write a handshake to the stream
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, handshake: &Handshake) -> Result<()> {
    writer.write_all(&handshake.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Message::Piece {
            index: 3,
            begin: 16384,
            block: Bytes::from_static(b"block"),
        };
        write_message(&mut a, &sent).await.unwrap();
        write_message(&mut a, &Message::KeepAlive).await.unwrap();

        assert_eq!(read_message(&mut b).await.unwrap(), sent);
        assert_eq!(read_message(&mut b).await.unwrap(), Message::KeepAlive);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let handshake = Handshake::new([4u8; 20], [5u8; 20]);
        write_handshake(&mut a, &handshake).await.unwrap();
        assert_eq!(read_handshake(&mut b).await.unwrap(), handshake);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        assert!(read_message(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_is_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_message(&mut b).await.is_err());
    }
}
