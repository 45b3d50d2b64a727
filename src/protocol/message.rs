//! BitTorrent protocol messages
//!
//! Framed peer wire messages (BEP 3) plus the BEP 10 extended envelope.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            _ => Err(TorrentError::protocol_with_detail(
                "Invalid message ID",
                format!("value: {}", value),
            )
            .into()),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// BEP 10 extended message; id 0 is the extended handshake
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        let body = match self {
            Message::KeepAlive => return 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have { .. } => 4,
            Message::Bitfield { bitfield } => bitfield.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
            Message::Port { .. } => 2,
            Message::Extended { payload, .. } => 1 + payload.len(),
        };
        1 + body as u32
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }

    /// Decode a frame body (the bytes after the length prefix)
    ///
    /// An empty body is a keep-alive.
    pub fn decode_body(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(body.get_u8())?;
        trace!("Decoding {:?} with {} payload bytes", message_id, body.len());

        let need = |body: &Bytes, n: usize, what: &str| -> Result<()> {
            if body.remaining() < n {
                return Err(TorrentError::protocol_with_detail(
                    format!("{} message too short", what),
                    format!("expected {} bytes, got {}", n, body.remaining()),
                )
                .into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(&body, 4, "Have")?;
                Message::Have {
                    piece_index: body.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: body },
            MessageId::Request | MessageId::Cancel => {
                need(&body, 12, "Request")?;
                let index = body.get_u32();
                let begin = body.get_u32();
                let length = body.get_u32();
                if message_id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                need(&body, 8, "Piece")?;
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: body,
                }
            }
            MessageId::Port => {
                need(&body, 2, "Port")?;
                Message::Port {
                    listen_port: body.get_u16(),
                }
            }
            MessageId::Extended => {
                need(&body, 1, "Extended")?;
                let id = body.get_u8();
                Message::Extended { id, payload: body }
            }
        };

        Ok(message)
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        if buf.remaining() < 4 {
            return Err(TorrentError::protocol("Message too short: missing length prefix").into());
        }
        let length = buf.get_u32() as usize;
        if buf.remaining() < length {
            return Err(TorrentError::protocol_with_detail(
                "Truncated message",
                format!("length prefix {}, {} bytes available", length, buf.remaining()),
            )
            .into());
        }
        Self::decode_body(buf.split_to(length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_encoding() {
        assert_eq!(Message::KeepAlive.serialize().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&[0, 0, 0, 0]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_wire_layout() {
        let bytes = Message::Request { index: 1, begin: 16384, length: 16384 }.serialize();
        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_piece_message() {
        let message = Message::Piece {
            index: 10,
            begin: 0,
            block: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let decoded = Message::deserialize(&message.serialize()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(message.length(), 14);
    }

    #[test]
    fn test_extended_message() {
        let message = Message::Extended {
            id: 0,
            payload: Bytes::from_static(b"de"),
        };
        let bytes = message.serialize();
        assert_eq!(bytes[4], 20);
        assert_eq!(Message::deserialize(&bytes).unwrap(), message);
    }

    #[test]
    fn test_cancel_is_distinct_from_request() {
        let cancel = Message::Cancel { index: 2, begin: 0, length: 5 };
        assert_eq!(Message::deserialize(&cancel.serialize()).unwrap(), cancel);
    }

    #[test]
    fn test_short_have_rejected() {
        assert!(Message::decode_body(Bytes::from_static(&[4, 0, 0])).is_err());
    }

    #[test]
    fn test_unknown_id_rejected() {
        assert!(MessageId::try_from(10).is_err());
        assert!(Message::decode_body(Bytes::from_static(&[99])).is_err());
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Port { listen_port: 0 }.length(), 3);
        assert_eq!(
            Message::Bitfield { bitfield: Bytes::from_static(&[0xff, 0x80]) }.length(),
            3
        );
    }
}
