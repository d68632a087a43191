//! Tagged argument codec.
//!
//! Request and reply payloads carry an ordered, self-describing argument
//! list: an unsigned varint count followed by that many tagged values. The
//! tag values are fixed by the server contract and must not change.
//!
//! Reply payloads are prefixed with an error envelope (varint code plus
//! message string, empty on success) before the argument list.

use crate::error::ProtocolError;
use crate::wire::{Deserializer, Serializer};

const TAG_INT64: u64 = 0;
const TAG_DOUBLE: u64 = 1;
const TAG_STRING: u64 = 2;
const TAG_BOOL: u64 = 3;
const TAG_NULL: u64 = 4;
const TAG_INT: u64 = 5;
const TAG_TUPLE: u64 = 8;

/// A single wire argument.
///
/// Strings and byte blobs share a tag on the wire; the decoder always yields
/// [`Arg::Bytes`] for it, and [`Arg::as_str`] recovers text when the caller
/// expects it.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Int32Array(Vec<i32>),
    Null,
}

impl Arg {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value of an `Int32` or `Int64` argument.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int32(v) => Some(i64::from(*v)),
            Arg::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Arg::Int32(v) => Some(*v),
            Arg::Int64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::String(v) => Some(v.as_bytes()),
            Arg::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(v) => Some(v),
            Arg::Bytes(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }

    pub fn as_i32_array(&self) -> Option<&[i32]> {
        match self {
            Arg::Int32Array(v) => Some(v),
            _ => None,
        }
    }
}

/// Encodes one tagged argument.
pub fn put_arg(ser: &mut Serializer, arg: &Arg) {
    match arg {
        Arg::Bool(v) => {
            ser.put_var_uint(TAG_BOOL);
            ser.put_var_uint(u64::from(*v));
        }
        Arg::Int32(v) => {
            ser.put_var_uint(TAG_INT);
            ser.put_var_int(i64::from(*v));
        }
        Arg::Int64(v) => {
            ser.put_var_uint(TAG_INT64);
            ser.put_var_int(*v);
        }
        Arg::Double(v) => {
            ser.put_var_uint(TAG_DOUBLE);
            ser.put_f64(*v);
        }
        Arg::String(v) => {
            ser.put_var_uint(TAG_STRING);
            ser.put_v_string(v);
        }
        Arg::Bytes(v) => {
            ser.put_var_uint(TAG_STRING);
            ser.put_v_bytes(v);
        }
        Arg::Int32Array(v) => {
            ser.put_var_uint(TAG_TUPLE);
            ser.put_var_uint(v.len() as u64);
            for e in v {
                ser.put_var_uint(TAG_INT);
                ser.put_var_int(i64::from(*e));
            }
        }
        Arg::Null => ser.put_var_uint(TAG_NULL),
    }
}

/// Decodes one tagged argument.
pub fn get_arg(de: &mut Deserializer<'_>) -> Result<Arg, ProtocolError> {
    let tag = de.get_var_uint()?;
    match tag {
        TAG_INT64 => Ok(Arg::Int64(de.get_var_int()?)),
        TAG_DOUBLE => Ok(Arg::Double(de.get_f64()?)),
        TAG_STRING => Ok(Arg::Bytes(de.get_v_bytes()?.to_vec())),
        TAG_BOOL => Ok(Arg::Bool(de.get_var_uint()? != 0)),
        TAG_NULL => Ok(Arg::Null),
        TAG_INT => {
            let v = de.get_var_int()?;
            Ok(Arg::Int32(
                i32::try_from(v).map_err(|_| ProtocolError::BadVarint)?,
            ))
        }
        TAG_TUPLE => {
            let count = de.get_var_uint()? as usize;
            let mut out = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let elem_tag = de.get_var_uint()?;
                if elem_tag != TAG_INT {
                    return Err(ProtocolError::UnknownArgTag(elem_tag));
                }
                let v = de.get_var_int()?;
                out.push(i32::try_from(v).map_err(|_| ProtocolError::BadVarint)?);
            }
            Ok(Arg::Int32Array(out))
        }
        other => Err(ProtocolError::UnknownArgTag(other)),
    }
}

/// Encodes a counted argument list.
pub fn put_args(ser: &mut Serializer, args: &[Arg]) {
    ser.put_var_uint(args.len() as u64);
    for arg in args {
        put_arg(ser, arg);
    }
}

/// Decodes a counted argument list, appending to `out`.
pub fn get_args(de: &mut Deserializer<'_>, out: &mut Vec<Arg>) -> Result<(), ProtocolError> {
    let count = de.get_var_uint()? as usize;
    out.reserve(count.min(4096));
    for _ in 0..count {
        out.push(get_arg(de)?);
    }
    Ok(())
}

/// Error envelope leading every reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub code: u64,
    pub message: String,
}

impl RemoteStatus {
    pub fn ok() -> Self {
        Self {
            code: crate::errcode::OK,
            message: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == crate::errcode::OK
    }
}

/// Parses a reply payload: the error envelope, then (on success) the
/// argument list into `args`. `args` is cleared first so callers can reuse
/// its storage across replies.
pub fn parse_reply_into(
    payload: &[u8],
    args: &mut Vec<Arg>,
) -> Result<RemoteStatus, ProtocolError> {
    args.clear();
    let mut de = Deserializer::new(payload);
    let code = de.get_var_uint()?;
    let message = de.get_v_string()?.to_owned();
    let status = RemoteStatus { code, message };
    if !status.is_ok() {
        return Ok(status);
    }
    get_args(&mut de, args)?;
    Ok(status)
}
