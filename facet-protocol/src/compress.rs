//! Snappy block compression.
//!
//! Payloads are whole snappy blocks (not the framed stream format). Each
//! frame's own header flag decides whether its payload is compressed, so
//! both directions are handled independently.

use crate::error::ProtocolError;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data: Vec<u8> = b"facetdb ".repeat(64);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decompress(&[0xFF; 16]),
            Err(ProtocolError::Compression(_))
        ));
    }
}
