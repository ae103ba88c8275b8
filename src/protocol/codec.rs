use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::core::Error;
use super::{ACK_FRAME_LEN, INCOMING_FRAME_LEN};

/// 8-bit additive checksum: the sum of all bytes modulo 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Returns true when the last byte equals the checksum of the bytes before it
pub fn verify(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((&sum, body)) => checksum(body) == sum,
        None => false,
    }
}

/// Appends the checksum of everything already in `frame`
pub fn append_checksum(frame: &mut Vec<u8>) {
    let sum = checksum(frame);
    frame.push(sum);
}

/// Which fixed-size frame the byte stream is expected to carry next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Unsolicited 26-byte frame from the device
    Incoming,
    /// 5-byte acknowledgment of an outgoing command
    Ack,
}

impl FrameKind {
    /// Frame length in bytes
    pub fn frame_len(self) -> usize {
        match self {
            FrameKind::Incoming => INCOMING_FRAME_LEN,
            FrameKind::Ack => ACK_FRAME_LEN,
        }
    }
}

/// Splits a byte stream into fixed-size frames
///
/// The codec does not look at frame contents; checksum validation happens in
/// the incoming registry and in the acknowledgment path of the engine.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    kind: FrameKind,
}

impl FrameCodec {
    /// Creates a codec expecting unsolicited frames
    pub fn new() -> Self {
        FrameCodec {
            kind: FrameKind::Incoming,
        }
    }

    /// Switches the expected frame kind
    pub fn set_kind(&mut self, kind: FrameKind) {
        self.kind = kind;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = self.kind.frame_len();
        if src.len() < len {
            // Need more data for a whole frame
            return Ok(None);
        }

        Ok(Some(src.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
        assert_eq!(checksum(&[0x80; 4]), 0x00);
    }

    #[test]
    fn test_verify() {
        assert!(verify(&[0x10, 0x20, 0x30, 0x40, 0xa0]));
        assert!(!verify(&[0x10, 0x20, 0x30, 0x40, 0xa1]));
        assert!(verify(&[0x00]));
        assert!(!verify(&[]));
    }

    #[test]
    fn test_append_checksum() {
        let mut frame = vec![0xf0, 0x20];
        append_checksum(&mut frame);
        assert_eq!(frame, vec![0xf0, 0x20, 0x10]);
        assert!(verify(&frame));
    }

    #[test]
    fn test_codec_waits_for_whole_frame() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::from(&[0u8; 25][..]);

        assert!(codec.decode(&mut bytes).unwrap().is_none());
        assert_eq!(bytes.len(), 25);

        bytes.extend_from_slice(&[0u8; 3]);
        let frame = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(frame.len(), INCOMING_FRAME_LEN);
        assert_eq!(bytes.len(), 2);
    }

    #[test]
    fn test_codec_ack_kind() {
        let mut codec = FrameCodec::new();
        codec.set_kind(FrameKind::Ack);
        let mut bytes = BytesMut::from(&[1u8, 2, 3, 4, 10, 7][..]);

        let frame = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(&frame[..], &[1, 2, 3, 4, 10]);
        assert_eq!(&bytes[..], &[7]);
        assert!(codec.decode(&mut bytes).unwrap().is_none());
    }
}
