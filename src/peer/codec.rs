//! Wire constants and the post-handshake framed message codec (spec §4.1).
//!
//! `Message` is the decoded form of one frame body; `MessageCodec` is a
//! `tokio_util::codec` `Encoder`/`Decoder` pair that speaks the 4-byte
//! length-prefixed frame envelope over a `Framed<T, MessageCodec>`. Bytes
//! are plaintext at this layer: when MSE is active, [`super::crypto`]'s
//! cipher runs underneath, outside the codec, the same way
//! [`super::session`] wraps reads and writes of the underlying stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MessageError;

/// The literal protocol name sent in every plaintext handshake.
pub const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// Length of the reserved capability-flags field.
pub const RESERVED_LEN: usize = 8;

/// Reserved-flags bit for DHT support (last byte).
pub const RESERVED_DHT: u8 = 0x01;
/// Reserved-flags bit for the (unused) cache extension (last byte).
pub const RESERVED_CACHE: u8 = 0x02;
/// Reserved-flags bit for the FAST extension (last byte).
pub const RESERVED_FAST: u8 = 0x04;

/// Total length of the plaintext handshake: `1 + 19 + 8 + 20 + 20`.
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_NAME.len() + RESERVED_LEN + 20 + 20;

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const PORT: u8 = 9;
const SUGGEST_PIECE: u8 = 13;
const HAVE_ALL: u8 = 14;
const HAVE_NONE: u8 = 15;
const REJECT_REQUEST: u8 = 16;
const ALLOWED_FAST: u8 = 17;

/// A decoded post-handshake frame body (spec §4.1). `KeepAlive` stands for
/// the zero-length frame, which carries no type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bytes: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },
    SuggestPiece { index: u32 },
    HaveAll,
    HaveNone,
    RejectRequest { index: u32, begin: u32, length: u32 },
    AllowedFast { index: u32 },
}

impl Message {
    fn type_byte(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(CHOKE),
            Message::Unchoke => Some(UNCHOKE),
            Message::Interested => Some(INTERESTED),
            Message::NotInterested => Some(NOT_INTERESTED),
            Message::Have { .. } => Some(HAVE),
            Message::Bitfield { .. } => Some(BITFIELD),
            Message::Request { .. } => Some(REQUEST),
            Message::Piece { .. } => Some(PIECE),
            Message::Cancel { .. } => Some(CANCEL),
            Message::Port { .. } => Some(PORT),
            Message::SuggestPiece { .. } => Some(SUGGEST_PIECE),
            Message::HaveAll => Some(HAVE_ALL),
            Message::HaveNone => Some(HAVE_NONE),
            Message::RejectRequest { .. } => Some(REJECT_REQUEST),
            Message::AllowedFast { .. } => Some(ALLOWED_FAST),
        }
    }
}

/// Encodes and decodes [`Message`] frames, given the configured ceiling on
/// frame length. Does not itself know about FAST negotiation or
/// `got_anything`; that validation happens in [`super::dispatch`], which
/// keeps this codec a pure wire-format translator.
pub struct MessageCodec {
    pub max_message_length: u32,
}

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let type_byte = msg.type_byte();
        let body_len = match &msg {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. }
            | Message::SuggestPiece { .. }
            | Message::AllowedFast { .. } => 5,
            Message::Bitfield { bytes } => 1 + bytes.len(),
            Message::Request { .. } | Message::Cancel { .. } | Message::RejectRequest { .. } => {
                13
            }
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Port { .. } => 3,
        };

        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        if let Some(type_byte) = type_byte {
            dst.put_u8(type_byte);
        }
        match msg {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {}
            Message::Have { index } | Message::SuggestPiece { index } | Message::AllowedFast { index } => {
                dst.put_u32(index);
            }
            Message::Bitfield { bytes } => dst.put_slice(&bytes),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length }
            | Message::RejectRequest { index, begin, length } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            Message::Piece { index, begin, data } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_slice(&data);
            }
            Message::Port { port } => dst.put_u16(port),
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length > self.max_message_length {
            return Err(MessageError::TooLong {
                length,
                max: self.max_message_length,
            });
        }
        if src.len() < 4 + length as usize {
            src.reserve(4 + length as usize - src.len());
            return Ok(None);
        }

        src.advance(4);
        if length == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut body = src.split_to(length as usize);
        let type_byte = body.get_u8();
        let msg = match type_byte {
            CHOKE => require_len(&body, 0, type_byte).map(|_| Message::Choke)?,
            UNCHOKE => require_len(&body, 0, type_byte).map(|_| Message::Unchoke)?,
            INTERESTED => require_len(&body, 0, type_byte).map(|_| Message::Interested)?,
            NOT_INTERESTED => require_len(&body, 0, type_byte).map(|_| Message::NotInterested)?,
            HAVE_ALL => require_len(&body, 0, type_byte).map(|_| Message::HaveAll)?,
            HAVE_NONE => require_len(&body, 0, type_byte).map(|_| Message::HaveNone)?,
            HAVE => require_len(&body, 4, type_byte).map(|_| Message::Have {
                index: body.get_u32(),
            })?,
            SUGGEST_PIECE => require_len(&body, 4, type_byte).map(|_| Message::SuggestPiece {
                index: body.get_u32(),
            })?,
            ALLOWED_FAST => require_len(&body, 4, type_byte).map(|_| Message::AllowedFast {
                index: body.get_u32(),
            })?,
            PORT => require_len(&body, 2, type_byte).map(|_| Message::Port {
                port: body.get_u16(),
            })?,
            BITFIELD => Message::Bitfield {
                bytes: body.to_vec(),
            },
            REQUEST => require_len(&body, 12, type_byte).map(|_| Message::Request {
                index: body.get_u32(),
                begin: body.get_u32(),
                length: body.get_u32(),
            })?,
            CANCEL => require_len(&body, 12, type_byte).map(|_| Message::Cancel {
                index: body.get_u32(),
                begin: body.get_u32(),
                length: body.get_u32(),
            })?,
            REJECT_REQUEST => require_len(&body, 12, type_byte).map(|_| Message::RejectRequest {
                index: body.get_u32(),
                begin: body.get_u32(),
                length: body.get_u32(),
            })?,
            PIECE => {
                if body.len() < 9 {
                    return Err(MessageError::WrongLength(PIECE));
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: body.to_vec(),
                }
            }
            other => return Err(MessageError::UnknownType(other)),
        };
        Ok(Some(msg))
    }
}

fn require_len(body: &BytesMut, expected: usize, type_byte: u8) -> Result<(), MessageError> {
    if body.len() != expected {
        Err(MessageError::WrongLength(type_byte))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codec() -> MessageCodec {
        MessageCodec {
            max_message_length: 1 << 18,
        }
    }

    fn round_trip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        codec().encode(msg, &mut buf).unwrap();
        codec().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn have_round_trip_is_bit_exact() {
        let mut buf = BytesMut::new();
        codec()
            .encode(Message::Have { index: 0x0102_0304 }, &mut buf)
            .unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x00, 0x00, 0x05, 0x04, 0x01, 0x02, 0x03, 0x04][..]
        );
    }

    #[test]
    fn keepalive_round_trips() {
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn choke_unchoke_interested_round_trip() {
        assert_eq!(round_trip(Message::Choke), Message::Choke);
        assert_eq!(round_trip(Message::Unchoke), Message::Unchoke);
        assert_eq!(round_trip(Message::Interested), Message::Interested);
        assert_eq!(round_trip(Message::NotInterested), Message::NotInterested);
    }

    #[test]
    fn request_and_piece_round_trip() {
        let req = Message::Request {
            index: 1,
            begin: 2,
            length: 16384,
        };
        assert_eq!(round_trip(req.clone()), req);

        let piece = Message::Piece {
            index: 1,
            begin: 0,
            data: vec![1, 2, 3, 4],
        };
        assert_eq!(round_trip(piece.clone()), piece);
    }

    #[test]
    fn fast_messages_round_trip() {
        assert_eq!(round_trip(Message::HaveAll), Message::HaveAll);
        assert_eq!(round_trip(Message::HaveNone), Message::HaveNone);
        let reject = Message::RejectRequest {
            index: 1,
            begin: 0,
            length: 16384,
        };
        assert_eq!(round_trip(reject.clone()), reject);
        assert_eq!(
            round_trip(Message::AllowedFast { index: 7 }),
            Message::AllowedFast { index: 7 }
        );
    }

    #[test]
    fn rejects_oversize_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32((1 << 18) + 1);
        let mut codec = codec();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MessageError::TooLong { .. })
        ));
    }

    #[test]
    fn rejects_wrong_length_have() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(HAVE);
        buf.put_u16(0);
        let mut codec = codec();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MessageError::WrongLength(HAVE))
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        let mut codec = codec();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MessageError::UnknownType(200))
        ));
    }

    #[test]
    fn decoding_is_invariant_to_chunking() {
        // feed the same byte stream through the decoder split into
        // differently-sized chunks and assert the resulting message
        // sequence is identical regardless of chunk boundaries (§8).
        let messages = vec![
            Message::Have { index: 1 },
            Message::Bitfield { bytes: vec![0xff, 0x00] },
            Message::Request { index: 2, begin: 0, length: 16384 },
            Message::KeepAlive,
            Message::Piece { index: 2, begin: 0, data: vec![9; 32] },
        ];
        let mut whole = BytesMut::new();
        for msg in &messages {
            codec().encode(msg.clone(), &mut whole).unwrap();
        }
        let whole = whole.to_vec();

        for chunk_size in [1usize, 2, 3, 7, 16, whole.len()] {
            let mut codec = codec();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for chunk in whole.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                while let Some(msg) = codec.decode(&mut buf).unwrap() {
                    decoded.push(msg);
                }
            }
            assert_eq!(decoded, messages, "mismatch at chunk_size={}", chunk_size);
        }
    }

    #[test]
    fn incomplete_frame_awaits_more_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(HAVE);
        // only 1 of the 4 index bytes arrived so far
        buf.put_u8(0);
        let mut codec = codec();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
