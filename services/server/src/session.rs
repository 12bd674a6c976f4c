//! Per-connection session runtime.
//!
//! One tokio task per accepted connection owns a `Session` and drives the
//! loop: decode FPDU, check the state machine, dispatch to the handler for
//! that kind, emit the response. The task is the sole mutator of its
//! session and transfer contexts; the only shared state it touches is the
//! journal, the directory snapshot, and the audit stream.
//!
//! Errors never propagate past this loop: every failure is converted into
//! (diagnostic, audit entry, optional ABORT) and the transport is closed.

use crate::audit::{AuditCategory, AuditEvent, AuditLog, AuditOutcome};
use crate::config::{ListenerConfig, PartnerConfig};
use crate::directory::Directory;
use crate::files::{FileError, FileReader, FileWriter};
use crate::handlers::{self, HandlerAction};
use crate::secrets::{SecretError, SecretStore};
use crate::state::SessionState;
use crate::storage::journal::{Direction, TransferJournal};
use crate::storage::StorageError;
use crate::transport::IoStream;
use futures_util::{SinkExt, StreamExt};
use pesit_core::{CodecError, DiagnosticCode, Fpdu, FpduCodec, FpduKind, ParamValue, pi};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on a reassembled multi-segment message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How many received bytes may accumulate between journal progress writes.
pub(crate) const PROGRESS_FLUSH_BYTES: u64 = 1024 * 1024;

/// Bound for the pre-connection garbage scan.
const PRE_CONNECTION_SCAN_BYTES: usize = 256;

static NEXT_CONNECTION_ID: AtomicU16 = AtomicU16::new(1);

/// Allocate a locally-unique, nonzero server connection id.
pub fn next_connection_id() -> u16 {
    loop {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("file: {0}")]
    File(#[from] FileError),
    #[error("secrets: {0}")]
    Secret(#[from] SecretError),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer violated the sync protocol: {0}")]
    SyncProtocol(String),
    #[error("peer closed the connection")]
    ConnectionClosed,
}

impl SessionError {
    /// Diagnostic carried by the ABORT emitted for this error.
    pub fn diagnostic(&self) -> DiagnosticCode {
        match self {
            SessionError::Codec(CodecError::UnknownKind { .. }) => DiagnosticCode::UNKNOWN_FPDU,
            SessionError::Codec(_) => DiagnosticCode::MALFORMED_FPDU,
            SessionError::File(FileError::Collision(_)) => DiagnosticCode::FILE_COLLISION,
            SessionError::File(FileError::NotFound(_)) => DiagnosticCode::FILE_NOT_FOUND,
            SessionError::File(_) => DiagnosticCode::DIR_NOT_WRITABLE,
            SessionError::SyncProtocol(_) => DiagnosticCode::SYNC_TIMEOUT,
            SessionError::ConnectionClosed => DiagnosticCode::PEER_DISCONNECTED,
            _ => DiagnosticCode::new(5, 500),
        }
    }
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// The in-memory transfer context for the session's single active transfer.
pub struct TransferContext {
    pub record_id: String,
    pub filename: String,
    pub file_type: u32,
    pub record_format: String,
    pub record_length: u32,
    pub max_reservation: u64,
    pub local_path: std::path::PathBuf,
    pub direction: Direction,
    pub bytes_transferred: u64,
    pub record_count: u64,
    pub last_sync_point: u64,
    pub sync_point_count: u32,
    /// Byte offset the transfer (re)starts from.
    pub start_byte: u64,
    /// Bytes accumulated since the last journal progress write.
    pub unflushed_bytes: u64,
    /// Known size of the source file (send direction).
    pub file_size: u64,
    /// Transfer reference the peer supplied in PI_13.
    pub peer_transfer_id: u64,
    /// Negotiated DTF payload bound: the listener's limit, lowered by the
    /// peer's PI_25 when given.
    pub max_entity_size: usize,
    /// Creation date from PGI_50/PI_51, kept verbatim.
    pub creation_date: Option<String>,
    pub writer: Option<FileWriter>,
    pub reader: Option<FileReader>,
    /// Checksum captured when the output file is finished.
    pub checksum: Option<String>,
}

/// Per-connection session state. Owned exclusively by one task.
pub struct Session {
    pub session_id: String,
    pub state: SessionState,
    /// Connection id the client chose (X); echoed as destination on every
    /// response in this session.
    pub client_connection_id: u16,
    /// Our own id (Y); stable once assigned.
    pub server_connection_id: u16,
    pub partner_id: Option<String>,
    pub requested_server_id: Option<String>,
    pub protocol_version: u8,
    pub access_type: u8,
    pub sync_points_enabled: bool,
    pub sync_interval_kb: u32,
    pub resync_enabled: bool,
    pub crc_enabled: bool,
    pub remote_addr: SocketAddr,
    pub started_at: std::time::Instant,
    pub last_activity: std::time::Instant,
    pub partner: Option<PartnerConfig>,
    pub transfer: Option<TransferContext>,
    pub message_buffer: Option<Vec<u8>>,
    pub aborted: bool,
}

impl Session {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Session {
            session_id: Uuid::new_v4().to_string(),
            state: SessionState::Cn01Repos,
            client_connection_id: 0,
            server_connection_id: 0,
            partner_id: None,
            requested_server_id: None,
            protocol_version: 0,
            access_type: 2,
            sync_points_enabled: false,
            sync_interval_kb: 0,
            resync_enabled: false,
            crc_enabled: false,
            remote_addr,
            started_at: std::time::Instant::now(),
            last_activity: std::time::Instant::now(),
            partner: None,
            transfer: None,
            message_buffer: None,
            aborted: false,
        }
    }

    /// Move to `next`, checking the static transition table. A violation
    /// here is a server bug, not peer input; it is logged and the state is
    /// forced so the session can still shut down. ERROR is reachable from
    /// every state.
    pub fn set_state(&mut self, next: SessionState) {
        if next != self.state
            && next != SessionState::Error
            && !self.state.valid_next().contains(&next)
        {
            warn!(
                session = %self.session_id,
                from = %self.state,
                to = %next,
                "internal transition outside the declared table"
            );
        }
        debug!(session = %self.session_id, from = %self.state, to = %next, "state");
        self.state = next;
    }

    /// A response FPDU addressed to the peer: destination echoes the
    /// client's connection id, source is ours.
    pub fn reply(&self, kind: FpduKind) -> Fpdu {
        Fpdu::new(kind, self.client_connection_id, self.server_connection_id)
    }

    /// A reply carrying a leading PI_02 diagnostic.
    pub fn reply_diag(&self, kind: FpduKind, diag: DiagnosticCode) -> Fpdu {
        self.reply(kind)
            .with_params(vec![ParamValue::bytes(pi::DIAGNOSTIC, diag.to_bytes())])
    }
}

/// Shared collaborators handed to every session of a listener.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<ListenerConfig>,
    pub directory: Arc<Directory>,
    pub journal: TransferJournal,
    pub audit: AuditLog,
    pub secrets: Arc<dyn SecretStore>,
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

/// Drive one accepted connection to completion.
pub async fn run_session(
    io: IoStream,
    remote_addr: SocketAddr,
    deps: SessionDeps,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut codec = FpduCodec::new().with_max_frame(
        // Header + parameters on top of the negotiated entity size.
        (deps.config.max_entity_size + 512).min(pesit_core::MAX_FRAME_SIZE),
    );
    if deps.config.pre_connection_filter {
        codec = codec.with_connect_scan(PRE_CONNECTION_SCAN_BYTES);
    }
    let mut framed = Framed::new(io, codec);
    let mut session = Session::new(remote_addr);
    debug!(session = %session.session_id, peer = %remote_addr, "session started");

    let outcome = session_loop(&mut framed, &mut session, &deps, &mut shutdown).await;

    if let Err(e) = &outcome {
        let diag = e.diagnostic();
        warn!(session = %session.session_id, error = %e, diagnostic = %diag, "session error");
        // Best effort: the transport may already be gone.
        let abort = session.reply_diag(FpduKind::Abort, diag);
        let _ = framed.send(abort).await;
    }

    cleanup(&mut session, &deps, outcome.err().map(|e| e.to_string())).await;
    debug!(session = %session.session_id, "session closed");
}

async fn session_loop(
    framed: &mut Framed<IoStream, FpduCodec>,
    session: &mut Session,
    deps: &SessionDeps,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    loop {
        // The connection timeout covers the whole CONNECT -> ACONNECT
        // handshake; afterwards the idle read timeout applies.
        let wait = if session.state == SessionState::Cn01Repos {
            Duration::from_millis(deps.config.connection_timeout_ms)
        } else {
            Duration::from_millis(deps.config.read_timeout_ms)
        };

        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Listener is stopping; abort the peer if we still can.
                    let abort = session.reply_diag(FpduKind::Abort, DiagnosticCode::PEER_DISCONNECTED);
                    let _ = framed.send(abort).await;
                    return Ok(());
                }
                continue;
            }
            next = tokio::time::timeout(wait, framed.next()) => match next {
                // Idle past the limit: the peer is unresponsive by
                // definition, so no FPDU is emitted.
                Err(_) => {
                    info!(session = %session.session_id, "read timeout; closing");
                    return Ok(());
                }
                Ok(None) => {
                    if session.state == SessionState::Cn01Repos
                        || session.state == SessionState::Cn04bReleasePending
                    {
                        return Ok(());
                    }
                    return Err(SessionError::ConnectionClosed);
                }
                Ok(Some(Err(e))) => return Err(handle_codec_error(session, e)),
                Ok(Some(Ok(frame))) => frame,
            },
        };

        session.last_activity = std::time::Instant::now();
        debug!(session = %session.session_id, kind = %frame.kind, state = %session.state, "fpdu");

        // Peer-initiated abort: tear down without a response.
        if frame.kind == FpduKind::Abort {
            session.aborted = true;
            info!(
                session = %session.session_id,
                diagnostic = %frame.diagnostic().unwrap_or(DiagnosticCode::SUCCESS),
                "peer abort"
            );
            return Ok(());
        }

        // State machine gate.
        let Some(pending) = session.state.transition_for(frame.kind) else {
            return invalid_transition(framed, session, deps, frame.kind).await;
        };
        session.set_state(pending);

        match handlers::dispatch(session, deps, &frame).await? {
            HandlerAction::Reply(fpdu) => {
                framed.send(fpdu).await?;
            }
            HandlerAction::NoReply => {}
            HandlerAction::ReplyThenClose(fpdu) => {
                framed.send(fpdu).await?;
                return Ok(());
            }
            HandlerAction::StartSend(ack) => {
                framed.send(ack).await?;
                handlers::send::run_send(framed, session, deps).await?;
            }
            HandlerAction::Abort(diag, reason) => {
                warn!(session = %session.session_id, diagnostic = %diag, reason = %reason, "abort");
                let abort = session.reply_diag(FpduKind::Abort, diag);
                framed.send(abort).await?;
                session.set_state(SessionState::Error);
                return Ok(());
            }
        }
    }
}

fn handle_codec_error(session: &Session, e: CodecError) -> SessionError {
    match &e {
        CodecError::UnknownKind { phase, kind } => {
            warn!(session = %session.session_id, phase = *phase, kind = *kind, "unknown FPDU kind");
        }
        other => {
            warn!(session = %session.session_id, error = %other, "malformed frame");
        }
    }
    SessionError::Codec(e)
}

async fn invalid_transition(
    framed: &mut Framed<IoStream, FpduCodec>,
    session: &mut Session,
    deps: &SessionDeps,
    kind: FpduKind,
) -> Result<(), SessionError> {
    warn!(
        session = %session.session_id,
        state = %session.state,
        kind = %kind,
        "invalid state transition"
    );
    let mut event = AuditEvent::new(
        AuditCategory::Security,
        "INVALID_STATE_TRANSITION",
        AuditOutcome::Failure,
    )
    .session(&session.session_id)
    .client_ip(&session.remote_addr.ip().to_string())
    .error(
        &DiagnosticCode::INVALID_TRANSITION.to_string(),
        &format!("{kind} not legal in {}", session.state),
    );
    if let Some(partner) = &session.partner_id {
        event = event.partner(partner);
    }
    deps.audit.record(event).await?;

    let abort = session.reply_diag(FpduKind::Abort, DiagnosticCode::INVALID_TRANSITION);
    let _ = framed.send(abort).await;
    session.set_state(SessionState::Error);
    Ok(())
}

/// Mark any unfinished transfer interrupted and audit the session end.
///
/// The transfer context is cleared on completion, so its mere presence
/// here means the transfer never finished, whatever state the session
/// died in.
async fn cleanup(session: &mut Session, deps: &SessionDeps, error: Option<String>) {
    if let Some(transfer) = session.transfer.take() {
        let reason = error.as_deref().unwrap_or("session closed mid-transfer");
        let _ = deps
            .journal
            .update_progress(&transfer.record_id, transfer.bytes_transferred)
            .await;
        if let Err(e) = deps
            .journal
            .interrupt_transfer(&transfer.record_id, reason)
            .await
        {
            // Terminal records (e.g. already completed) refuse this; fine.
            debug!(transfer = %transfer.record_id, error = %e, "interrupt skipped");
        } else {
            info!(
                transfer = %transfer.record_id,
                last_sync_point = transfer.last_sync_point,
                "transfer interrupted"
            );
            let _ = deps
                .audit
                .record(
                    AuditEvent::new(
                        AuditCategory::Transfer,
                        "TRANSFER_INTERRUPTED",
                        AuditOutcome::Failure,
                    )
                    .session(&session.session_id)
                    .transfer(&transfer.record_id)
                    .filename(&transfer.filename)
                    .bytes(transfer.bytes_transferred)
                    .error(
                        &DiagnosticCode::PEER_DISCONNECTED.to_string(),
                        error.as_deref().unwrap_or("interrupted"),
                    ),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_nonzero_and_distinct() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn reply_echoes_client_connection_id() {
        let mut session = Session::new("127.0.0.1:9".parse().unwrap());
        session.client_connection_id = 0x0A01;
        session.server_connection_id = 0x0001;
        let fpdu = session.reply(FpduKind::Aconnect);
        assert_eq!(fpdu.destination, 0x0A01);
        assert_eq!(fpdu.source, 0x0001);
    }

    #[test]
    fn error_diagnostics_map_by_class() {
        assert_eq!(
            SessionError::Codec(CodecError::Malformed("x".into())).diagnostic(),
            DiagnosticCode::MALFORMED_FPDU
        );
        assert_eq!(
            SessionError::Codec(CodecError::UnknownKind { phase: 9, kind: 9 }).diagnostic(),
            DiagnosticCode::UNKNOWN_FPDU
        );
        assert_eq!(
            SessionError::ConnectionClosed.diagnostic(),
            DiagnosticCode::PEER_DISCONNECTED
        );
        assert_eq!(
            SessionError::SyncProtocol("t".into()).diagnostic(),
            DiagnosticCode::SYNC_TIMEOUT
        );
    }
}
