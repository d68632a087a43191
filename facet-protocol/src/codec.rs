//! Frame composition for requests and replies.
//!
//! A request payload is the caller's argument list followed by a trailing
//! one-argument chunk carrying the execution timeout in milliseconds (0 for
//! none). A reply payload is the error envelope plus the result argument
//! list. Either payload may be a snappy block when the header's compression
//! flag is set.

use crate::args::{self, Arg, RemoteStatus};
use crate::compress;
use crate::error::ProtocolError;
use crate::frame::FrameHeader;
use crate::wire::{Deserializer, Serializer};
use crate::{HDR_LEN, PROTOCOL_VERSION};
use bytes::BytesMut;

fn seal(cmd: u16, seq: u32, body: Serializer, compressed: bool) -> Result<BytesMut, ProtocolError> {
    let packed;
    let payload = if compressed {
        packed = compress::compress(body.as_slice())?;
        packed.as_slice()
    } else {
        body.as_slice()
    };

    let mut out = Serializer::with_capacity(HDR_LEN + payload.len());
    FrameHeader {
        version: PROTOCOL_VERSION,
        compressed,
        cmd,
        size: payload.len() as u32,
        seq,
    }
    .encode_into(&mut out);
    out.put_slice(payload);
    Ok(out.into_bytes())
}

/// Encodes a complete request frame.
pub fn encode_request(
    cmd: u16,
    seq: u32,
    call_args: &[Arg],
    exec_timeout_ms: i64,
    compressed: bool,
) -> Result<BytesMut, ProtocolError> {
    let mut body = Serializer::new();
    args::put_args(&mut body, call_args);
    args::put_args(&mut body, &[Arg::Int64(exec_timeout_ms)]);
    seal(cmd, seq, body, compressed)
}

/// Decodes a request payload into its argument list and execution timeout.
/// The trailing chunk is optional on the wire.
pub fn decode_request(payload: &[u8]) -> Result<(Vec<Arg>, i64), ProtocolError> {
    let mut de = Deserializer::new(payload);
    let mut out = Vec::new();
    args::get_args(&mut de, &mut out)?;

    let mut exec_timeout_ms = 0;
    if !de.is_empty() {
        let mut extra = Vec::new();
        args::get_args(&mut de, &mut extra)?;
        if let Some(ms) = extra.first().and_then(Arg::as_i64) {
            exec_timeout_ms = ms;
        }
    }
    Ok((out, exec_timeout_ms))
}

/// Encodes a complete reply frame.
pub fn encode_reply(
    cmd: u16,
    seq: u32,
    status: &RemoteStatus,
    reply_args: &[Arg],
    compressed: bool,
) -> Result<BytesMut, ProtocolError> {
    let mut body = Serializer::new();
    body.put_var_uint(status.code);
    body.put_v_string(&status.message);
    if status.is_ok() {
        args::put_args(&mut body, reply_args);
    }
    seal(cmd, seq, body, compressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::parse_reply_into;

    fn split_frame(raw: &[u8]) -> (FrameHeader, Vec<u8>) {
        let hdr: [u8; HDR_LEN] = raw[..HDR_LEN].try_into().unwrap();
        let header = FrameHeader::decode(&hdr).unwrap();
        let payload = raw[HDR_LEN..].to_vec();
        assert_eq!(payload.len(), header.size as usize);
        (header, payload)
    }

    #[test]
    fn test_request_roundtrip() {
        let call_args = vec![
            Arg::String("user".into()),
            Arg::Bool(true),
            Arg::Int32(-1),
        ];
        let raw = encode_request(1, 512, &call_args, 2500, false).unwrap();
        let (header, payload) = split_frame(&raw);

        assert_eq!(header.cmd, 1);
        assert_eq!(header.seq, 512);
        assert!(!header.compressed);

        let (decoded, exec_timeout_ms) = decode_request(&payload).unwrap();
        assert_eq!(exec_timeout_ms, 2500);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_str(), Some("user"));
        assert_eq!(decoded[1].as_bool(), Some(true));
        assert_eq!(decoded[2].as_i32(), Some(-1));
    }

    #[test]
    fn test_request_without_trailing_chunk() {
        let mut body = Serializer::new();
        args::put_args(&mut body, &[Arg::Int32(5)]);
        let (decoded, exec_timeout_ms) = decode_request(body.as_slice()).unwrap();
        assert_eq!(decoded[0].as_i32(), Some(5));
        assert_eq!(exec_timeout_ms, 0);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply_args = vec![Arg::Bytes(b"pong".to_vec())];
        let raw = encode_reply(0, 7, &RemoteStatus::ok(), &reply_args, false).unwrap();
        let (header, payload) = split_frame(&raw);
        assert_eq!(header.seq, 7);

        let mut args = Vec::new();
        let status = parse_reply_into(&payload, &mut args).unwrap();
        assert!(status.is_ok());
        assert_eq!(args[0].as_bytes(), Some(&b"pong"[..]));
    }

    #[test]
    fn test_compressed_reply_equals_uncompressed() {
        let reply_args = vec![Arg::Bytes(vec![0x42; 512]), Arg::Int64(3)];

        let plain = encode_reply(48, 99, &RemoteStatus::ok(), &reply_args, false).unwrap();
        let packed = encode_reply(48, 99, &RemoteStatus::ok(), &reply_args, true).unwrap();

        let (plain_hdr, plain_payload) = split_frame(&plain);
        let (packed_hdr, packed_payload) = split_frame(&packed);
        assert!(!plain_hdr.compressed);
        assert!(packed_hdr.compressed);
        assert!(packed_payload.len() < plain_payload.len());

        let unpacked = compress::decompress(&packed_payload).unwrap();
        assert_eq!(unpacked, plain_payload);

        let mut args = Vec::new();
        parse_reply_into(&unpacked, &mut args).unwrap();
        assert_eq!(args[0].as_bytes(), Some(&[0x42u8; 512][..]));
        assert_eq!(args[1].as_i64(), Some(3));
    }

    #[test]
    fn test_compressed_request_roundtrip() {
        let call_args = vec![Arg::Bytes(b"x".repeat(256))];
        let raw = encode_request(33, 4, &call_args, 0, true).unwrap();
        let (header, payload) = split_frame(&raw);
        assert!(header.compressed);

        let unpacked = compress::decompress(&payload).unwrap();
        let (decoded, _) = decode_request(&unpacked).unwrap();
        assert_eq!(decoded[0].as_bytes(), Some(&b"x".repeat(256)[..]));
    }

    #[test]
    fn test_error_reply_has_no_args() {
        let status = RemoteStatus {
            code: 4,
            message: "bad query".into(),
        };
        let raw = encode_reply(48, 11, &status, &[Arg::Int32(1)], false).unwrap();
        let (_, payload) = split_frame(&raw);

        let mut args = Vec::new();
        let decoded = parse_reply_into(&payload, &mut args).unwrap();
        assert_eq!(decoded, status);
        assert!(args.is_empty());
    }
}
