//! Frame layout shared by every JobGrid connection.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload bytes.
//! The payload itself is opaque at this layer.

use crate::error::{Result, TransportError};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload accepted on the wire (64 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Protocol version announced in every handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Encodes a payload length into its prefix.
pub fn encode_length(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(TransportError::PayloadTooLarge {
            size: len,
            max_size: MAX_PAYLOAD_SIZE,
        });
    }
    Ok((len as u32).to_be_bytes())
}

/// Decodes a length prefix, rejecting lengths above `max_payload`.
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE], max_payload: usize) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_payload {
        return Err(TransportError::InvalidFrame {
            reason: format!("declared length {} exceeds maximum {}", len, max_payload),
        });
    }
    Ok(len)
}

/// Builds a complete frame (prefix + payload).
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let prefix = encode_length(payload.len())?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(&[]).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0]);
        assert_eq!(decode_length([0, 0, 0, 0], MAX_PAYLOAD_SIZE).unwrap(), 0);
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let prefix = 1025u32.to_be_bytes();
        let err = decode_length(prefix, 1024).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame { .. }));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let err = encode_length(MAX_PAYLOAD_SIZE + 1).unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
    }
}
