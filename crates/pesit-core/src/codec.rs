//! Framed FPDU encode/decode.
//!
//! # Frame layout
//! `[len: u16] [phase: u8] [type: u8] [dest: u16] [src: u16] [body]`,
//! all big-endian. `len` counts every byte after the length field, so a
//! complete frame is `2 + len` bytes. For data-bearing kinds the body is
//! the raw payload; for every other kind the body is an ordered parameter
//! list (see `param`).
//!
//! The `FpduCodec` integrates with `tokio_util::codec::Framed` for use on
//! a live transport. `encode_fpdu`/`decode_fpdu` operate on complete
//! buffers and back the property tests.

use crate::error::CodecError;
use crate::fpdu::{Fpdu, FpduKind};
use crate::param::decode_params;
use crate::{FPDU_HEADER_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

// ---------------------------------------------------------------------------
// Whole-buffer encode/decode
// ---------------------------------------------------------------------------

/// Encode a complete FPDU, length prefix included.
pub fn encode_fpdu(fpdu: &Fpdu) -> Result<BytesMut, CodecError> {
    let body_len = if fpdu.kind.carries_data() {
        fpdu.payload.len()
    } else {
        fpdu.params.iter().map(|p| p.encoded_len()).sum()
    };
    let frame_len = FPDU_HEADER_SIZE + body_len;
    if 2 + frame_len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            declared: 2 + frame_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(2 + frame_len);
    buf.put_u16(frame_len as u16);
    buf.put_u8(fpdu.kind.phase());
    buf.put_u8(fpdu.kind.type_code());
    buf.put_u16(fpdu.destination);
    buf.put_u16(fpdu.source);
    if fpdu.kind.carries_data() {
        buf.put_slice(&fpdu.payload);
    } else {
        for p in &fpdu.params {
            p.encode(&mut buf);
        }
    }
    Ok(buf)
}

/// Decode exactly one FPDU from a complete frame buffer.
///
/// The buffer must contain the whole frame and nothing else.
pub fn decode_fpdu(input: &[u8]) -> Result<Fpdu, CodecError> {
    if input.len() < 2 + FPDU_HEADER_SIZE {
        return Err(CodecError::malformed(format!(
            "frame of {} bytes is shorter than the {}-byte minimum",
            input.len(),
            2 + FPDU_HEADER_SIZE
        )));
    }
    let declared = usize::from(u16::from_be_bytes([input[0], input[1]]));
    if declared < FPDU_HEADER_SIZE {
        return Err(CodecError::malformed(format!(
            "declared length {declared} is below the header size"
        )));
    }
    if input.len() != 2 + declared {
        return Err(CodecError::malformed(format!(
            "declared length {declared} but {} bytes present",
            input.len() - 2
        )));
    }
    decode_frame_body(&input[2..])
}

/// Decode the post-length portion of a frame (header + body).
fn decode_frame_body(frame: &[u8]) -> Result<Fpdu, CodecError> {
    let kind = FpduKind::from_wire(frame[0], frame[1])?;
    let destination = u16::from_be_bytes([frame[2], frame[3]]);
    let source = u16::from_be_bytes([frame[4], frame[5]]);
    let body = &frame[FPDU_HEADER_SIZE..];

    let mut fpdu = Fpdu::new(kind, destination, source);
    if kind.carries_data() {
        fpdu.payload = body.to_vec();
    } else {
        fpdu.params = decode_params(body)?;
    }
    Ok(fpdu)
}

// ---------------------------------------------------------------------------
// Streaming codec
// ---------------------------------------------------------------------------

/// Streaming FPDU codec for `tokio_util::codec::Framed`.
pub struct FpduCodec {
    max_frame: usize,
    /// When set, leading bytes are discarded until a plausible CONNECT
    /// header is found (pre-connection compatibility filter). Cleared
    /// after the first decoded frame.
    scan_for_connect: bool,
    scan_budget: usize,
}

impl FpduCodec {
    pub fn new() -> Self {
        FpduCodec {
            max_frame: MAX_FRAME_SIZE,
            scan_for_connect: false,
            scan_budget: 0,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.min(MAX_FRAME_SIZE);
        self
    }

    /// Enable the pre-connection filter: up to `budget` leading bytes are
    /// consumed until a CONNECT header is recognized.
    pub fn with_connect_scan(mut self, budget: usize) -> Self {
        self.scan_for_connect = true;
        self.scan_budget = budget;
        self
    }

    /// Drop leading bytes until `src` starts with something that parses as
    /// a CONNECT frame header. Returns an error once the budget is spent.
    fn scan(&mut self, src: &mut BytesMut) -> Result<(), CodecError> {
        while src.len() >= 4 {
            if src[2] == FpduKind::Connect.phase() && src[3] == FpduKind::Connect.type_code() {
                let declared = usize::from(u16::from_be_bytes([src[0], src[1]]));
                if declared >= FPDU_HEADER_SIZE && 2 + declared <= self.max_frame {
                    self.scan_for_connect = false;
                    return Ok(());
                }
            }
            if self.scan_budget == 0 {
                return Err(CodecError::malformed(
                    "no CONNECT found within the pre-connection scan budget",
                ));
            }
            self.scan_budget -= 1;
            src.advance(1);
        }
        Ok(())
    }
}

impl Default for FpduCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FpduCodec {
    type Item = Fpdu;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Fpdu>, CodecError> {
        if self.scan_for_connect {
            self.scan(src)?;
            if self.scan_for_connect {
                // Still hunting; need more bytes.
                return Ok(None);
            }
        }
        if src.len() < 2 {
            return Ok(None);
        }
        let declared = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if declared < FPDU_HEADER_SIZE {
            return Err(CodecError::malformed(format!(
                "declared length {declared} is below the header size"
            )));
        }
        if 2 + declared > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                declared: 2 + declared,
                max: self.max_frame,
            });
        }
        if src.len() < 2 + declared {
            src.reserve(2 + declared - src.len());
            return Ok(None);
        }
        src.advance(2);
        let frame = src.split_to(declared);
        decode_frame_body(&frame).map(Some)
    }
}

impl Encoder<Fpdu> for FpduCodec {
    type Error = CodecError;

    fn encode(&mut self, fpdu: Fpdu, dst: &mut BytesMut) -> Result<(), CodecError> {
        let buf = encode_fpdu(&fpdu)?;
        if buf.len() > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                declared: buf.len(),
                max: self.max_frame,
            });
        }
        dst.extend_from_slice(&buf);
        Ok(())
    }
}


#[cfg(test)]
mod properties {
    use super::*;
    use crate::param::{ParamValue, pi};
    use proptest::prelude::*;

    fn arb_primitive() -> impl Strategy<Value = ParamValue> {
        (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..300)).prop_filter_map(
            "group ids open groups, not primitives",
            |(id, value)| {
                if crate::param::GROUP_IDS.contains(&id) {
                    None
                } else {
                    Some(ParamValue::Param { id, value })
                }
            },
        )
    }

    fn arb_param() -> impl Strategy<Value = ParamValue> {
        prop_oneof![
            4 => arb_primitive(),
            1 => (
                proptest::sample::select(crate::param::GROUP_IDS.to_vec()),
                proptest::collection::vec(arb_primitive(), 0..4),
            )
                .prop_map(|(id, params)| ParamValue::Group { id, params }),
        ]
    }

    fn arb_control_kind() -> impl Strategy<Value = FpduKind> {
        proptest::sample::select(vec![
            FpduKind::Connect,
            FpduKind::Aconnect,
            FpduKind::Rconnect,
            FpduKind::AckCreate,
            FpduKind::AckSelect,
            FpduKind::Write,
            FpduKind::AckWrite,
            FpduKind::Syn,
            FpduKind::AckSyn,
            FpduKind::TransEnd,
            FpduKind::AckTransEnd,
            FpduKind::Msg,
            FpduKind::AckMsg,
        ])
    }

    fn arb_fpdu() -> impl Strategy<Value = Fpdu> {
        prop_oneof![
            3 => (
                arb_control_kind(),
                any::<u16>(),
                any::<u16>(),
                proptest::collection::vec(arb_param(), 0..6),
            )
                .prop_map(|(kind, destination, source, params)| Fpdu {
                    kind,
                    destination,
                    source,
                    params,
                    payload: Vec::new(),
                }),
            1 => (
                any::<u16>(),
                any::<u16>(),
                proptest::collection::vec(any::<u8>(), 0..2048),
            )
                .prop_map(|(destination, source, payload)| Fpdu {
                    kind: FpduKind::Dtf,
                    destination,
                    source,
                    params: Vec::new(),
                    payload,
                }),
        ]
    }

    proptest! {
        /// decode(encode(fpdu)) == fpdu, content and parameter order.
        #[test]
        fn decode_encode_identity(fpdu in arb_fpdu()) {
            let encoded = encode_fpdu(&fpdu).unwrap();
            prop_assert_eq!(decode_fpdu(&encoded).unwrap(), fpdu);
        }

        /// encode(decode(bytes)) == bytes, byte-for-byte.
        #[test]
        fn encode_decode_byte_identity(fpdu in arb_fpdu()) {
            let bytes = encode_fpdu(&fpdu).unwrap();
            let reencoded = encode_fpdu(&decode_fpdu(&bytes).unwrap()).unwrap();
            prop_assert_eq!(reencoded, bytes);
        }

        /// Any truncation of a valid frame decodes to malformed, no panic.
        #[test]
        fn truncation_reports_malformed(fpdu in arb_fpdu(), cut in any::<prop::sample::Index>()) {
            let encoded = encode_fpdu(&fpdu).unwrap();
            let len = cut.index(encoded.len().max(1));
            if len < encoded.len() {
                prop_assert!(decode_fpdu(&encoded[..len]).is_err());
            }
        }

        /// An unknown parameter id inserted between known parameters is
        /// preserved opaquely and re-emitted in position.
        #[test]
        fn unknown_param_preserved_in_position(
            value in proptest::collection::vec(any::<u8>(), 0..64),
            pos_seed in any::<prop::sample::Index>(),
        ) {
            let mut params = vec![
                ParamValue::string(pi::REQUESTER_ID, "PART01"),
                ParamValue::uint(pi::VERSION, 2),
                ParamValue::uint(pi::ACCESS_TYPE, 2),
            ];
            let pos = pos_seed.index(params.len() + 1);
            let unknown = ParamValue::Param { id: 0x7D, value };
            params.insert(pos, unknown.clone());

            let fpdu = Fpdu::new(FpduKind::Connect, 0, 1).with_params(params);
            let decoded = decode_fpdu(&encode_fpdu(&fpdu).unwrap()).unwrap();
            prop_assert_eq!(&decoded.params[pos], &unknown);
            prop_assert_eq!(decoded, fpdu);
        }
    }
}
