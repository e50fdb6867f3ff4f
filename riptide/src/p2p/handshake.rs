use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::ID;
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Fixed frame: length byte, protocol string, reserved, hashes.
pub const HANDSHAKE_LEN: usize = 68;

pub struct Handshake {

    pub reserved: [u8; 8],

    pub info_hash: ID,

    pub peer_id: ID,

}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        Self {
            // No extensions advertised.
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL.len() as u8);
        dst.extend_from_slice(&PROTOCOL);
        dst.extend_from_slice(&handshake.reserved);
        dst.extend_from_slice(&handshake.info_hash);
        dst.extend_from_slice(&handshake.peer_id);
        debug_assert_eq!(dst.len() % HANDSHAKE_LEN, 0, "handshake frame is 68 bytes");
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }
        // Reject early rather than waiting for 68 bytes of garbage.
        if src[0] as usize != PROTOCOL.len() {
            return Err(PeerError::WrongProtocol);
        }
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        src.advance(1);
        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::WrongProtocol);
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(info_hash: u8, peer_id: u8) -> BytesMut {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        src.extend_from_slice(&[0; 8]);
        src.extend_from_slice(&[info_hash; 20]);
        src.extend_from_slice(&[peer_id; 20]);
        src
    }

    #[test]
    fn test_round_trip() {
        let mut encoded = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new([0xaa; 20], [0xbb; 20]), &mut encoded)
            .unwrap();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [0xaa; 20]);
        assert_eq!(decoded.peer_id, [0xbb; 20]);
        assert_eq!(decoded.reserved, [0; 8]);
    }

    #[test]
    fn test_incomplete_frame_waits() {
        let mut src = frame(1, 2);
        src.truncate(40);
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_wrong_protocol_rejected() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocoL");
        src.extend_from_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut src).is_err());

        let mut src = BytesMut::new();
        src.put_u8(20);
        assert!(HandshakeCodec.decode(&mut src).is_err());
    }

    #[test]
    fn test_trailing_bytes_preserved() {
        let mut src = frame(1, 2);
        src.extend_from_slice(&[0xff; 5]);
        let handshake = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.info_hash, [1; 20]);
        // Whatever follows the handshake belongs to the message codec.
        assert_eq!(src.len(), 5);
    }
}
