//! Binary frame header.
//!
//! Every frame on the wire is a 16-byte little-endian header followed by
//! `size` payload bytes:
//!
//! ```text
//! +---------+---------+---------+---------+---------+
//! | magic   | version | cmd     | size    | seq     |
//! | 4 bytes | 2 bytes | 2 bytes | 4 bytes | 4 bytes |
//! +---------+---------+---------+---------+---------+
//! ```
//!
//! The low 10 bits of `version` carry the protocol version; bit 10 flags a
//! snappy-compressed payload. `cmd` is the command code on requests and an
//! echo of it on replies; the client ignores the echo.

use crate::error::ProtocolError;
use crate::wire::{Deserializer, Serializer};
use crate::MIN_COMPAT_VERSION;

/// Magic word identifying facetdb RPC frames.
pub const MAGIC: u32 = 0xEEDD_1132;

/// Size of the frame header in bytes.
pub const HDR_LEN: usize = 16;

/// Mask selecting the protocol version bits of the header's version field.
pub const VERSION_MASK: u16 = 0x3FF;

/// Version-field bit flagging a snappy-compressed payload.
pub const VERSION_COMPRESSION_FLAG: u16 = 1 << 10;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version with the compression flag already masked off.
    pub version: u16,
    /// Whether the payload is a snappy block.
    pub compressed: bool,
    /// Command code (echoed by the server on replies).
    pub cmd: u16,
    /// Payload length in bytes, after optional compression.
    pub size: u32,
    /// Sequence number correlating the reply to its request.
    pub seq: u32,
}

impl FrameHeader {
    /// Decodes and validates a header.
    ///
    /// Rejects a foreign magic word and any version older than
    /// [`MIN_COMPAT_VERSION`].
    pub fn decode(raw: &[u8; HDR_LEN]) -> Result<Self, ProtocolError> {
        let mut de = Deserializer::new(raw);
        let magic = de.get_u32()?;
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let raw_version = de.get_u16()?;
        let cmd = de.get_u16()?;
        let size = de.get_u32()?;
        let seq = de.get_u32()?;

        let compressed = raw_version & VERSION_COMPRESSION_FLAG != 0;
        let version = raw_version & VERSION_MASK;
        if version < MIN_COMPAT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            compressed,
            cmd,
            size,
            seq,
        })
    }

    /// Encodes a header into `ser`.
    pub fn encode_into(&self, ser: &mut Serializer) {
        let mut version = self.version & VERSION_MASK;
        if self.compressed {
            version |= VERSION_COMPRESSION_FLAG;
        }
        ser.put_u32(MAGIC);
        ser.put_u16(version);
        ser.put_u16(self.cmd);
        ser.put_u32(self.size);
        ser.put_u32(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_VERSION;

    fn encode(header: &FrameHeader) -> [u8; HDR_LEN] {
        let mut ser = Serializer::with_capacity(HDR_LEN);
        header.encode_into(&mut ser);
        ser.as_slice().try_into().unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            compressed: false,
            cmd: 48,
            size: 1234,
            seq: 512_513,
        };
        let decoded = FrameHeader::decode(&encode(&header)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_compression_flag() {
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            compressed: true,
            cmd: 0,
            size: 64,
            seq: 7,
        };
        let raw = encode(&header);
        // Bit 10 of the version field is set on the wire.
        let wire_version = u16::from_le_bytes([raw[4], raw[5]]);
        assert_ne!(wire_version & VERSION_COMPRESSION_FLAG, 0);

        let decoded = FrameHeader::decode(&raw).unwrap();
        assert!(decoded.compressed);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_invalid_magic() {
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            compressed: false,
            cmd: 0,
            size: 0,
            seq: 0,
        };
        let mut raw = encode(&header);
        raw[3] = 0x00;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_version_too_old() {
        let header = FrameHeader {
            version: 0x100,
            compressed: false,
            cmd: 0,
            size: 0,
            seq: 0,
        };
        assert_eq!(
            FrameHeader::decode(&encode(&header)),
            Err(ProtocolError::UnsupportedVersion(0x100))
        );
    }

    #[test]
    fn test_min_compat_version_accepted() {
        let header = FrameHeader {
            version: MIN_COMPAT_VERSION,
            compressed: false,
            cmd: 1,
            size: 10,
            seq: 3,
        };
        assert!(FrameHeader::decode(&encode(&header)).is_ok());
    }
}
