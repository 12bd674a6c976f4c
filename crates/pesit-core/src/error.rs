use thiserror::Error;

/// Codec failure classes.
///
/// `Malformed` is fatal for the session (the byte stream can no longer be
/// trusted); `UnknownKind` is a protocol-level refusal and the session may
/// still emit an orderly ABORT.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown FPDU kind: phase 0x{phase:02x}, type 0x{kind:02x}")]
    UnknownKind { phase: u8, kind: u8 },

    #[error("frame of {declared} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// True when the byte stream is unrecoverable and the transport must close.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::UnknownKind { .. })
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        CodecError::Malformed(msg.into())
    }
}
