//! Framing: length-prefix (4 bytes LE) + bincode payload.
//! Used for LAN link frames, mesh packets and discovery beacons.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::MeshPacket;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a value into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a value into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: T =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Encode a mesh packet as it goes over the radio.
pub fn encode_packet(packet: &MeshPacket) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame(packet)
}

/// Decode a whole radio datagram into a mesh packet. Trailing bytes are rejected.
pub fn decode_packet(bytes: &[u8]) -> Result<MeshPacket, FrameDecodeError> {
    let (packet, used) = decode_frame::<MeshPacket>(bytes)?;
    if used != bytes.len() {
        return Err(FrameDecodeError::Decode(Box::new(bincode::ErrorKind::Custom(
            "trailing bytes after packet".into(),
        ))));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketKind, Signal, SignalingMessage, DEFAULT_TTL};

    fn sample_offer() -> SignalingMessage {
        SignalingMessage::new("host", Signal::Offer { sdp: "v=0\r\n".into() })
    }

    #[test]
    fn roundtrip_signaling_frame() {
        let msg = sample_offer();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame::<SignalingMessage>(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_offer()).unwrap();
        assert!(matches!(
            decode_frame::<SignalingMessage>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<SignalingMessage>(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = sample_offer();
        let b = SignalingMessage::new("peer-1", Signal::Bye);
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame::<SignalingMessage>(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame::<SignalingMessage>(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame::<SignalingMessage>(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn packet_roundtrip_and_garbage() {
        let packet = MeshPacket::broadcast("n1", PacketKind::Signaling, vec![1, 2, 3], DEFAULT_TTL);
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(decode_packet(&bytes).unwrap(), packet);

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(decode_packet(&trailing).is_err());
        assert!(decode_packet(&[0xff, 0x00, 0x00, 0x00, 0x01]).is_err());
    }
}
