use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{Block, BlockBytes, BlockInfo},
    Bitfield, BLOCK_SIZE,
};
use super::PeerError;

// Generous ceiling for a legal frame: a block message plus header, or
// a bitfield for a very large torrent. Anything bigger is hostile.
const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq, Eq)]
pub enum Message {

    // An empty frame; resets the peer's idle timer and nothing else.
    KeepAlive,

    // No further requests will be served.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // The sender wants to request blocks.
    Interested,

    NotInterested,

    // The sender acquired a piece.
    Have { idx: u32 },

    // Complete piece map; only legal directly after the handshake.
    Bitfield(Bitfield),

    Request(BlockInfo),

    // A block of piece data.
    Block(Block),

    Cancel(BlockInfo),

    // DHT listen port; parsed but unused here.
    Port { port: u16 },

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            }

            // <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            }

            // <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            }

            // <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            }

            // <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            }

            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            }

            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            // <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                let data = block.bytes.as_slice();
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(data);
            }

            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            // <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            }
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.len() < 4 {
            return Ok(None);
        }

        let msg_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if msg_len > MAX_FRAME_LEN {
            return Err(PeerError::Oversized(msg_len));
        }
        if src.len() < 4 + msg_len {
            src.reserve(4 + msg_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg = match src.get_u8() {

            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,

            4 => {
                if msg_len != 5 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Have { idx: src.get_u32() }
            }

            5 => {
                let mut raw = vec![0; msg_len - 1];
                src.copy_to_slice(&mut raw);
                Message::Bitfield(Bitfield::from_vec(raw))
            }

            6 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Request(BlockInfo {
                    piece_idx: src.get_u32() as usize,
                    offset: src.get_u32() as usize,
                    len: src.get_u32() as usize,
                })
            }

            7 => {
                if msg_len < 9 || msg_len - 9 > BLOCK_SIZE {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(Block {
                    piece_idx,
                    offset,
                    bytes: BlockBytes::Owned(data),
                })
            }

            8 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Cancel(BlockInfo {
                    piece_idx: src.get_u32() as usize,
                    offset: src.get_u32() as usize,
                    len: src.get_u32() as usize,
                })
            }

            9 => {
                if msg_len != 3 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Port {
                    port: src.get_u16(),
                }
            }

            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(
                f,
                "request {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.len
            ),
            Message::Block(block) => write!(
                f,
                "block {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx,
                block.offset,
                block.bytes.len()
            ),
            Message::Cancel(block) => write!(
                f,
                "cancel {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.len
            ),
            Message::Port { port } => write!(f, "port {}", port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_stream_round_trip() {

        let mut wire = BytesMut::new();
        // Keep alive
        wire.extend_from_slice(&[0, 0, 0, 0]);
        // Choke / unchoke / interested / not interested
        wire.extend_from_slice(&[0, 0, 0, 1, 0]);
        wire.extend_from_slice(&[0, 0, 0, 1, 1]);
        wire.extend_from_slice(&[0, 0, 0, 1, 2]);
        wire.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have 11
        wire.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        wire.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request piece 11, offset 0x134000, len 0x4000
        wire.extend_from_slice(&[0, 0, 0, 0xd, 6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Block piece 11, offset 0x134000, 3 data bytes
        wire.extend_from_slice(&[0, 0, 0, 12, 7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Cancel, mirror of the request
        wire.extend_from_slice(&[0, 0, 0, 0xd, 8, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Port 6881
        wire.extend_from_slice(&[0, 0, 0, 3, 9, 0x1a, 0xe1]);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockInfo {
                piece_idx: 0xb,
                offset: 0x134000,
                len: 0x4000,
            }),
            Message::Block(Block {
                piece_idx: 0xb,
                offset: 0x134000,
                bytes: BlockBytes::Owned(vec![0x1, 0x2, 0x3]),
            }),
            Message::Cancel(BlockInfo {
                piece_idx: 0xb,
                offset: 0x134000,
                len: 0x4000,
            }),
            Message::Port { port: 6881 },
        ];

        let expected_wire = wire.clone();
        let mut encoded = BytesMut::new();
        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut encoded).unwrap();
            let decoded = MessageCodec.decode(&mut wire).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
        assert_eq!(encoded, expected_wire);
    }

    #[test]
    fn test_decode_across_chunks() {

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Interested));

        buf.extend_from_slice(&[0, 0, 0, 12, 7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x2, 0x3]);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap(),
            Some(Message::Block(Block {
                piece_idx: 0xb,
                offset: 0x134000,
                bytes: BlockBytes::Owned(vec![0x1, 0x2, 0x3]),
            }))
        );
    }

    #[test]
    fn test_decode_empty_and_partial() {
        let mut src = BytesMut::new();
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);
        let mut src = BytesMut::from(&[0u8, 1, 2][..]);
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_invalid_id_rejected() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        match MessageCodec.decode(&mut src) {
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            other => panic!("expected InvalidMessageId, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut src = BytesMut::new();
        src.put_u32(MAX_FRAME_LEN as u32 + 1);
        src.put_u8(7);
        assert!(matches!(
            MessageCodec.decode(&mut src),
            Err(PeerError::Oversized(_))
        ));
    }

    #[test]
    fn test_overlong_block_rejected() {
        let mut src = BytesMut::new();
        // A block message claiming more than 16 KiB of payload.
        src.put_u32(9 + BLOCK_SIZE as u32 + 1);
        src.put_u8(7);
        src.put_u32(0);
        src.put_u32(0);
        src.extend_from_slice(&vec![0; BLOCK_SIZE + 1]);
        assert!(matches!(
            MessageCodec.decode(&mut src),
            Err(PeerError::InvalidMessage)
        ));
    }
}
