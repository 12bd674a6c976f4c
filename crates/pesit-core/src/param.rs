//! FPDU parameter values: PI primitives and PGI groups.
//!
//! # Wire form
//! Primitive: `[id: u8] [len: u8] [value]`; a value of 255 bytes or more
//! uses `len = 0xFF` followed by a big-endian u16 extended length.
//! Group: same shape with a group id; the length covers the nested
//! parameter bytes, which must themselves parse exactly as parameters.
//!
//! Unknown parameter ids are preserved opaquely as primitives and re-emitted
//! in position; nothing is ever dropped or reordered.

use crate::error::CodecError;
use bytes::{BufMut, BytesMut};

/// Parameter identifiers (PI_nn).
pub mod pi {
    /// CRC option.
    pub const CRC: u8 = 1;
    /// Diagnostic code.
    pub const DIAGNOSTIC: u8 = 2;
    /// Requester (partner) identifier.
    pub const REQUESTER_ID: u8 = 3;
    /// Server identifier.
    pub const SERVER_ID: u8 = 4;
    /// Access-control credential (password).
    pub const ACCESS_CONTROL: u8 = 5;
    /// Protocol version number.
    pub const VERSION: u8 = 6;
    /// Sync-point option: interval in KB (u16) + acknowledgement window (u8).
    pub const SYNC_OPTION: u8 = 7;
    /// File type.
    pub const FILE_TYPE: u8 = 11;
    /// Filename / virtual file identifier.
    pub const FILENAME: u8 = 12;
    /// Transfer identifier.
    pub const TRANSFER_ID: u8 = 13;
    /// Restart point (byte position).
    pub const RESTART_POINT: u8 = 18;
    /// Sync-point number.
    pub const SYNC_POINT_NUMBER: u8 = 20;
    /// Access type: 0 = read, 1 = write, 2 = mixed.
    pub const ACCESS_TYPE: u8 = 22;
    /// Resynchronization option.
    pub const RESYNC: u8 = 23;
    /// Maximum entity (DTF payload) size.
    pub const MAX_ENTITY_SIZE: u8 = 25;
    /// Total byte count of a transfer.
    pub const BYTE_COUNT: u8 = 27;
    /// Total record count of a transfer.
    pub const RECORD_COUNT: u8 = 28;
    /// Record format (F = fixed, V = variable).
    pub const RECORD_FORMAT: u8 = 31;
    /// Record length.
    pub const RECORD_LENGTH: u8 = 32;
    /// Reservation unit / file size in KB.
    pub const FILE_SIZE: u8 = 41;
    /// Maximum reservation.
    pub const MAX_RESERVATION: u8 = 42;
    /// Creation date (YYYYMMDDHHMMSS).
    pub const CREATION_DATE: u8 = 51;
    /// Last modification date (YYYYMMDDHHMMSS).
    pub const MODIFICATION_DATE: u8 = 52;
    /// Message content.
    pub const MESSAGE: u8 = 91;
    /// Free-form message content.
    pub const FREE_MESSAGE: u8 = 99;
}

/// Parameter group identifiers (PGI_nn).
pub mod pgi {
    /// File identification.
    pub const FILE_ID: u8 = 9;
    /// Logical attributes.
    pub const LOGICAL_ATTRS: u8 = 30;
    /// Physical attributes.
    pub const PHYSICAL_ATTRS: u8 = 40;
    /// Historical attributes.
    pub const HISTORICAL_ATTRS: u8 = 50;
}

/// Identifiers that open a nested parameter group rather than a primitive.
pub const GROUP_IDS: [u8; 4] = [
    pgi::FILE_ID,
    pgi::LOGICAL_ATTRS,
    pgi::PHYSICAL_ATTRS,
    pgi::HISTORICAL_ATTRS,
];

/// A single parameter value: a tagged primitive or a tagged group of
/// nested parameter values. Order within an FPDU is significant and
/// preserved exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Param { id: u8, value: Vec<u8> },
    Group { id: u8, params: Vec<ParamValue> },
}

impl ParamValue {
    /// Primitive carrying raw bytes.
    pub fn bytes(id: u8, value: impl Into<Vec<u8>>) -> Self {
        ParamValue::Param {
            id,
            value: value.into(),
        }
    }

    /// Primitive carrying a string.
    pub fn string(id: u8, value: &str) -> Self {
        ParamValue::Param {
            id,
            value: value.as_bytes().to_vec(),
        }
    }

    /// Primitive carrying an unsigned integer as minimal-length big-endian
    /// bytes (at least one byte).
    pub fn uint(id: u8, value: u64) -> Self {
        ParamValue::Param {
            id,
            value: encode_uint(value),
        }
    }

    /// A parameter group.
    pub fn group(id: u8, params: Vec<ParamValue>) -> Self {
        ParamValue::Group { id, params }
    }

    pub fn id(&self) -> u8 {
        match self {
            ParamValue::Param { id, .. } | ParamValue::Group { id, .. } => *id,
        }
    }

    /// Raw bytes of a primitive; `None` for groups.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ParamValue::Param { value, .. } => Some(value),
            ParamValue::Group { .. } => None,
        }
    }

    /// Primitive value interpreted as big-endian unsigned integer.
    /// `None` for groups and for values wider than 8 bytes.
    pub fn as_uint(&self) -> Option<u64> {
        let bytes = self.as_bytes()?;
        if bytes.is_empty() || bytes.len() > 8 {
            return None;
        }
        let mut v: u64 = 0;
        for b in bytes {
            v = (v << 8) | u64::from(*b);
        }
        Some(v)
    }

    /// Primitive value interpreted as UTF-8; `None` for groups or bad UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    /// Nested parameters of a group; `None` for primitives.
    pub fn as_group(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::Group { params, .. } => Some(params),
            ParamValue::Param { .. } => None,
        }
    }

    /// Encoded size in bytes, length header included.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            ParamValue::Param { value, .. } => value.len(),
            ParamValue::Group { params, .. } => {
                params.iter().map(ParamValue::encoded_len).sum()
            }
        };
        // id + short length, plus the u16 extension for long values
        let header = if body >= 0xFF { 4 } else { 2 };
        header + body
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let body_len = match self {
            ParamValue::Param { value, .. } => value.len(),
            ParamValue::Group { params, .. } => {
                params.iter().map(ParamValue::encoded_len).sum()
            }
        };
        buf.put_u8(self.id());
        if body_len >= 0xFF {
            buf.put_u8(0xFF);
            buf.put_u16(body_len as u16);
        } else {
            buf.put_u8(body_len as u8);
        }
        match self {
            ParamValue::Param { value, .. } => buf.put_slice(value),
            ParamValue::Group { params, .. } => {
                for p in params {
                    p.encode(buf);
                }
            }
        }
    }
}

/// Minimal-length big-endian encoding of an unsigned integer.
pub fn encode_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    bytes[first..].to_vec()
}

/// Parse an ordered parameter list from `input`, consuming it entirely.
pub fn decode_params(input: &[u8]) -> Result<Vec<ParamValue>, CodecError> {
    let mut params = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let (param, remaining) = decode_one(rest)?;
        params.push(param);
        rest = remaining;
    }
    Ok(params)
}

fn decode_one(input: &[u8]) -> Result<(ParamValue, &[u8]), CodecError> {
    if input.len() < 2 {
        return Err(CodecError::malformed(format!(
            "truncated parameter header: {} bytes left",
            input.len()
        )));
    }
    let id = input[0];
    let (body_len, header_len) = if input[1] == 0xFF {
        if input.len() < 4 {
            return Err(CodecError::malformed(
                "truncated extended parameter length",
            ));
        }
        (usize::from(u16::from_be_bytes([input[2], input[3]])), 4)
    } else {
        (usize::from(input[1]), 2)
    };
    let end = header_len + body_len;
    if input.len() < end {
        return Err(CodecError::malformed(format!(
            "parameter 0x{id:02x} declares {body_len} bytes but only {} remain",
            input.len() - header_len
        )));
    }
    let body = &input[header_len..end];
    let param = if GROUP_IDS.contains(&id) {
        // Group contents must parse exactly as nested parameters.
        ParamValue::Group {
            id,
            params: decode_params(body)?,
        }
    } else {
        ParamValue::Param {
            id,
            value: body.to_vec(),
        }
    };
    Ok((param, &input[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(params: &[ParamValue]) -> Vec<ParamValue> {
        let mut buf = BytesMut::new();
        for p in params {
            p.encode(&mut buf);
        }
        decode_params(&buf).expect("decode")
    }

    #[test]
    fn primitive_round_trip() {
        let params = vec![
            ParamValue::string(pi::REQUESTER_ID, "PART01"),
            ParamValue::uint(pi::VERSION, 2),
            ParamValue::bytes(pi::DIAGNOSTIC, [0u8, 0, 0]),
        ];
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn group_round_trip_preserves_nesting_and_order() {
        let params = vec![ParamValue::group(
            pgi::FILE_ID,
            vec![
                ParamValue::string(pi::FILENAME, "TESTFILE"),
                ParamValue::uint(pi::TRANSFER_ID, 42),
            ],
        )];
        let decoded = round_trip(&params);
        assert_eq!(decoded, params);
        let nested = decoded[0].as_group().unwrap();
        assert_eq!(nested[0].as_str(), Some("TESTFILE"));
        assert_eq!(nested[1].as_uint(), Some(42));
    }

    #[test]
    fn unknown_id_is_preserved_in_position() {
        let params = vec![
            ParamValue::uint(pi::VERSION, 2),
            ParamValue::bytes(0x7E, vec![1, 2, 3]),
            ParamValue::string(pi::SERVER_ID, "SRV1"),
        ];
        let decoded = round_trip(&params);
        assert_eq!(decoded, params);
        assert_eq!(decoded[1].id(), 0x7E);
    }

    #[test]
    fn long_value_uses_extended_length() {
        let value = vec![0xABu8; 300];
        let params = vec![ParamValue::bytes(pi::MESSAGE, value.clone())];
        let mut buf = BytesMut::new();
        params[0].encode(&mut buf);
        assert_eq!(buf[1], 0xFF);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 300);
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn boundary_value_of_255_bytes_round_trips() {
        let params = vec![ParamValue::bytes(pi::MESSAGE, vec![7u8; 255])];
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn truncated_parameter_is_malformed() {
        // Declares 10 bytes, supplies 3.
        let err = decode_params(&[pi::FILENAME, 10, b'a', b'b', b'c']).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let err = decode_params(&[pi::FILENAME]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn group_with_garbage_contents_is_malformed() {
        // PGI_09 whose body is a parameter declaring more bytes than present.
        let err = decode_params(&[pgi::FILE_ID, 3, pi::FILENAME, 200, 0]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn uint_encoding_is_minimal_big_endian() {
        assert_eq!(encode_uint(0), vec![0]);
        assert_eq!(encode_uint(0x1234), vec![0x12, 0x34]);
        assert_eq!(encode_uint(u64::from(u32::MAX)) , vec![0xFF; 4]);
        assert_eq!(ParamValue::uint(pi::BYTE_COUNT, 3072).as_uint(), Some(3072));
    }
}
