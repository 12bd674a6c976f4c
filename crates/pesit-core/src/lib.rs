// pesit-core: PeSIT-E wire protocol types and FPDU codec.
//
// This crate is transport-agnostic: it defines the FPDU model (kinds,
// parameters, diagnostics) and the framed byte codec, and nothing else.
// Session state and handler logic live in the server service.

pub mod codec;
pub mod diagnostic;
pub mod error;
pub mod fpdu;
pub mod param;

pub use codec::FpduCodec;
pub use diagnostic::DiagnosticCode;
pub use error::CodecError;
pub use fpdu::{Fpdu, FpduKind};
pub use param::{ParamValue, pgi, pi};

/// PeSIT-E protocol version spoken by this implementation (PI_06).
pub const PROTOCOL_VERSION: u8 = 2;

/// Fixed FPDU header size: phase, type, destination id, source id.
/// The u16 length prefix is not included (it counts these 6 bytes + body).
pub const FPDU_HEADER_SIZE: usize = 6;

/// Hard ceiling on a single FPDU frame, length prefix included.
pub const MAX_FRAME_SIZE: usize = 65_535;
