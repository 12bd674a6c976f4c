//! FPDU model: kinds and the assembled protocol data unit.

use crate::diagnostic::DiagnosticCode;
use crate::error::CodecError;
use crate::param::ParamValue;
use std::fmt;

/// Every FPDU kind, identified on the wire by a (phase, type) byte pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpduKind {
    // Connection phase (0x20)
    Connect,
    Aconnect,
    Rconnect,
    Release,
    Relconf,
    Abort,
    // File selection (0x21)
    Create,
    AckCreate,
    Select,
    AckSelect,
    Deselect,
    AckDeselect,
    // File open (0x22)
    Open,
    AckOpen,
    Close,
    AckClose,
    // Transfer control (0x23)
    Write,
    AckWrite,
    Read,
    AckRead,
    // Data (0x24)
    Dtf,
    DtfEnd,
    Syn,
    AckSyn,
    Resyn,
    AckResyn,
    TransEnd,
    AckTransEnd,
    // Messages (0x25)
    Msg,
    Msgdm,
    Msgmm,
    Msgfm,
    AckMsg,
}

/// (kind, phase byte, type byte): the wire identity of every FPDU kind.
const KIND_TABLE: [(FpduKind, u8, u8); 33] = [
    (FpduKind::Connect, 0x20, 0x01),
    (FpduKind::Aconnect, 0x20, 0x02),
    (FpduKind::Rconnect, 0x20, 0x03),
    (FpduKind::Release, 0x20, 0x04),
    (FpduKind::Relconf, 0x20, 0x05),
    (FpduKind::Abort, 0x20, 0x06),
    (FpduKind::Create, 0x21, 0x01),
    (FpduKind::AckCreate, 0x21, 0x02),
    (FpduKind::Select, 0x21, 0x03),
    (FpduKind::AckSelect, 0x21, 0x04),
    (FpduKind::Deselect, 0x21, 0x05),
    (FpduKind::AckDeselect, 0x21, 0x06),
    (FpduKind::Open, 0x22, 0x01),
    (FpduKind::AckOpen, 0x22, 0x02),
    (FpduKind::Close, 0x22, 0x03),
    (FpduKind::AckClose, 0x22, 0x04),
    (FpduKind::Write, 0x23, 0x01),
    (FpduKind::AckWrite, 0x23, 0x02),
    (FpduKind::Read, 0x23, 0x03),
    (FpduKind::AckRead, 0x23, 0x04),
    (FpduKind::Dtf, 0x24, 0x01),
    (FpduKind::DtfEnd, 0x24, 0x02),
    (FpduKind::Syn, 0x24, 0x03),
    (FpduKind::AckSyn, 0x24, 0x04),
    (FpduKind::Resyn, 0x24, 0x05),
    (FpduKind::AckResyn, 0x24, 0x06),
    (FpduKind::TransEnd, 0x24, 0x07),
    (FpduKind::AckTransEnd, 0x24, 0x08),
    (FpduKind::Msg, 0x25, 0x01),
    (FpduKind::Msgdm, 0x25, 0x02),
    (FpduKind::Msgmm, 0x25, 0x03),
    (FpduKind::Msgfm, 0x25, 0x04),
    (FpduKind::AckMsg, 0x25, 0x05),
];

impl FpduKind {
    pub fn phase(self) -> u8 {
        KIND_TABLE.iter().find(|(k, _, _)| *k == self).unwrap().1
    }

    pub fn type_code(self) -> u8 {
        KIND_TABLE.iter().find(|(k, _, _)| *k == self).unwrap().2
    }

    pub fn from_wire(phase: u8, type_code: u8) -> Result<Self, CodecError> {
        KIND_TABLE
            .iter()
            .find(|(_, p, t)| *p == phase && *t == type_code)
            .map(|(k, _, _)| *k)
            .ok_or(CodecError::UnknownKind {
                phase,
                kind: type_code,
            })
    }

    /// Data-bearing kinds carry a raw payload instead of parameters.
    pub fn carries_data(self) -> bool {
        matches!(self, FpduKind::Dtf | FpduKind::DtfEnd)
    }
}

impl fmt::Display for FpduKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FpduKind::Connect => "CONNECT",
            FpduKind::Aconnect => "ACONNECT",
            FpduKind::Rconnect => "RCONNECT",
            FpduKind::Release => "RELEASE",
            FpduKind::Relconf => "RELCONF",
            FpduKind::Abort => "ABORT",
            FpduKind::Create => "CREATE",
            FpduKind::AckCreate => "ACK_CREATE",
            FpduKind::Select => "SELECT",
            FpduKind::AckSelect => "ACK_SELECT",
            FpduKind::Deselect => "DESELECT",
            FpduKind::AckDeselect => "ACK_DESELECT",
            FpduKind::Open => "OPEN",
            FpduKind::AckOpen => "ACK_OPEN",
            FpduKind::Close => "CLOSE",
            FpduKind::AckClose => "ACK_CLOSE",
            FpduKind::Write => "WRITE",
            FpduKind::AckWrite => "ACK_WRITE",
            FpduKind::Read => "READ",
            FpduKind::AckRead => "ACK_READ",
            FpduKind::Dtf => "DTF",
            FpduKind::DtfEnd => "DTF_END",
            FpduKind::Syn => "SYN",
            FpduKind::AckSyn => "ACK_SYN",
            FpduKind::Resyn => "RESYN",
            FpduKind::AckResyn => "ACK_RESYN",
            FpduKind::TransEnd => "TRANS_END",
            FpduKind::AckTransEnd => "ACK_TRANS_END",
            FpduKind::Msg => "MSG",
            FpduKind::Msgdm => "MSGDM",
            FpduKind::Msgmm => "MSGMM",
            FpduKind::Msgfm => "MSGFM",
            FpduKind::AckMsg => "ACK_MSG",
        };
        f.write_str(name)
    }
}

/// A framed protocol data unit.
///
/// `destination` and `source` are the 2-byte connection ids used for
/// multiplexing; a server response always echoes the client's connection
/// id as `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fpdu {
    pub kind: FpduKind,
    pub destination: u16,
    pub source: u16,
    pub params: Vec<ParamValue>,
    /// Raw payload; only present for data-bearing kinds.
    pub payload: Vec<u8>,
}

impl Fpdu {
    pub fn new(kind: FpduKind, destination: u16, source: u16) -> Self {
        Fpdu {
            kind,
            destination,
            source,
            params: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<ParamValue>) -> Self {
        self.params = params;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// First top-level parameter with the given id.
    pub fn param(&self, id: u8) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.id() == id)
    }

    /// First parameter with `id` nested inside the top-level group `group_id`.
    pub fn group_param(&self, group_id: u8, id: u8) -> Option<&ParamValue> {
        self.param(group_id)?
            .as_group()?
            .iter()
            .find(|p| p.id() == id)
    }

    pub fn param_uint(&self, id: u8) -> Option<u64> {
        self.param(id)?.as_uint()
    }

    pub fn param_str(&self, id: u8) -> Option<&str> {
        self.param(id)?.as_str()
    }

    /// Diagnostic code carried in PI_02, when present and well-formed.
    pub fn diagnostic(&self) -> Option<DiagnosticCode> {
        DiagnosticCode::from_bytes(self.param(crate::param::pi::DIAGNOSTIC)?.as_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{pgi, pi};

    #[test]
    fn kind_table_is_bijective() {
        for (kind, phase, type_code) in KIND_TABLE {
            assert_eq!(kind.phase(), phase);
            assert_eq!(kind.type_code(), type_code);
            assert_eq!(FpduKind::from_wire(phase, type_code).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_wire_identity_is_rejected() {
        let err = FpduKind::from_wire(0x20, 0x7F).unwrap_err();
        assert!(matches!(err, CodecError::UnknownKind { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn only_dtf_kinds_carry_data() {
        for (kind, _, _) in KIND_TABLE {
            let expected = matches!(kind, FpduKind::Dtf | FpduKind::DtfEnd);
            assert_eq!(kind.carries_data(), expected, "{kind}");
        }
    }

    #[test]
    fn group_param_lookup() {
        let fpdu = Fpdu::new(FpduKind::Select, 1, 2).with_params(vec![ParamValue::group(
            pgi::FILE_ID,
            vec![ParamValue::string(pi::FILENAME, "REPORT")],
        )]);
        assert_eq!(
            fpdu.group_param(pgi::FILE_ID, pi::FILENAME).unwrap().as_str(),
            Some("REPORT")
        );
        assert!(fpdu.group_param(pgi::FILE_ID, pi::TRANSFER_ID).is_none());
    }

    #[test]
    fn diagnostic_accessor_reads_pi_02() {
        let fpdu = Fpdu::new(FpduKind::Rconnect, 3, 0).with_params(vec![ParamValue::bytes(
            pi::DIAGNOSTIC,
            DiagnosticCode::UNKNOWN_PARTNER.to_bytes(),
        )]);
        assert_eq!(fpdu.diagnostic(), Some(DiagnosticCode::UNKNOWN_PARTNER));
    }
}
