//! Open/close handler: OPEN moves the journal record into IN_PROGRESS and
//! readies the transfer; CLOSE releases the filesystem handle.

use super::HandlerAction;
use crate::session::{Session, SessionDeps, SessionError};
use crate::state::SessionState;
use crate::storage::journal::{Direction, TransferStatus};
use pesit_core::{DiagnosticCode, Fpdu, FpduKind};
use tracing::debug;

pub const KINDS: &[FpduKind] = &[FpduKind::Open, FpduKind::Close];

pub async fn handle(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    match fpdu.kind {
        FpduKind::Open => handle_open(session, deps).await,
        FpduKind::Close => handle_close(session, deps).await,
        other => Ok(HandlerAction::Abort(
            DiagnosticCode::UNKNOWN_FPDU,
            format!("{other} routed to the open/close handler"),
        )),
    }
}

async fn handle_open(
    session: &mut Session,
    deps: &SessionDeps,
) -> Result<HandlerAction, SessionError> {
    let Some(transfer) = session.transfer.as_ref() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "OPEN without a selected file".to_owned(),
        ));
    };

    // Resumed records are already IN_PROGRESS-capable via resume; fresh
    // ones move INITIATED -> IN_PROGRESS here.
    let record = deps.journal.get(&transfer.record_id).await?;
    let local_path = transfer.local_path.to_string_lossy().into_owned();
    match record.status {
        TransferStatus::Initiated => {
            let size = match transfer.direction {
                Direction::Send => transfer.file_size,
                Direction::Receive => 0,
            };
            deps.journal
                .start_transfer(&transfer.record_id, size, Some(&local_path))
                .await?;
        }
        TransferStatus::Interrupted => {
            deps.journal.resume_transfer(&transfer.record_id).await?;
        }
        other => {
            debug!(transfer = %transfer.record_id, status = %other, "open on active record");
        }
    }

    session.set_state(SessionState::Of02TransferReady);
    Ok(HandlerAction::Reply(
        session.reply_diag(FpduKind::AckOpen, DiagnosticCode::SUCCESS),
    ))
}

async fn handle_close(
    session: &mut Session,
    _deps: &SessionDeps,
) -> Result<HandlerAction, SessionError> {
    if let Some(transfer) = session.transfer.as_mut() {
        // The writer is normally finished by DTF_END; dropping here covers
        // a close without end-of-data.
        transfer.writer = None;
        transfer.reader = None;
    }
    session.set_state(SessionState::Sf03FileSelected);
    Ok(HandlerAction::Reply(
        session.reply_diag(FpduKind::AckClose, DiagnosticCode::SUCCESS),
    ))
}
