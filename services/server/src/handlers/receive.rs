//! Receive-side data transfer: WRITE, DTF streaming, sync points,
//! resynchronization, and end-of-transfer.
//!
//! DTF frames are written straight to the output file with no per-frame
//! acknowledgement; journal progress is debounced. SYN flushes to durable
//! storage, is acknowledged with the echoed sync-point number, and its
//! byte position becomes the restart point for any later resumption.

use super::HandlerAction;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome};
use crate::files::{FileError, FileWriter};
use crate::session::{PROGRESS_FLUSH_BYTES, Session, SessionDeps, SessionError};
use crate::state::SessionState;
use pesit_core::{DiagnosticCode, Fpdu, FpduKind, ParamValue, pi};
use tracing::{debug, info};

pub const KINDS: &[FpduKind] = &[
    FpduKind::Write,
    FpduKind::Dtf,
    FpduKind::DtfEnd,
    FpduKind::Syn,
    FpduKind::Resyn,
    FpduKind::TransEnd,
];

pub async fn handle(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    match fpdu.kind {
        FpduKind::Write => handle_write(session, deps).await,
        FpduKind::Dtf => handle_dtf(session, deps, fpdu).await,
        FpduKind::Syn => handle_syn(session, deps, fpdu).await,
        FpduKind::Resyn => handle_resyn(session, fpdu).await,
        FpduKind::DtfEnd => handle_dtf_end(session, fpdu).await,
        FpduKind::TransEnd => handle_trans_end(session, deps).await,
        other => Ok(HandlerAction::Abort(
            DiagnosticCode::UNKNOWN_FPDU,
            format!("{other} routed to the receive handler"),
        )),
    }
}

/// WRITE: allocate the output file and answer with the restart point:
/// zero for a fresh transfer, the last acknowledged sync position when
/// resuming.
async fn handle_write(
    session: &mut Session,
    deps: &SessionDeps,
) -> Result<HandlerAction, SessionError> {
    let Some(transfer) = session.transfer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "WRITE without a selected file".to_owned(),
        ));
    };

    if let Some(parent) = transfer.local_path.parent() {
        crate::files::validate_directory(parent).await?;
    }

    let writer = if transfer.start_byte > 0 {
        FileWriter::resume(&transfer.local_path, transfer.start_byte).await
    } else {
        FileWriter::create(&transfer.local_path).await
    };
    let writer = match writer {
        Ok(w) => w,
        Err(FileError::Collision(path)) => {
            info!(session = %session.session_id, path = %path.display(), "output collision");
            deps.audit
                .record(
                    AuditEvent::new(AuditCategory::Transfer, "FILE_COLLISION", AuditOutcome::Denied)
                        .session(&session.session_id)
                        .filename(&transfer.filename)
                        .error(&DiagnosticCode::FILE_COLLISION.to_string(), "output exists"),
                )
                .await?;
            session.set_state(SessionState::Of02TransferReady);
            return Ok(HandlerAction::Reply(
                session.reply_diag(FpduKind::AckWrite, DiagnosticCode::FILE_COLLISION),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let restart_point = transfer.start_byte;
    transfer.writer = Some(writer);
    session.set_state(SessionState::Tde02bReceivingData);

    Ok(HandlerAction::Reply(
        session.reply(FpduKind::AckWrite).with_params(vec![
            ParamValue::bytes(pi::DIAGNOSTIC, DiagnosticCode::SUCCESS.to_bytes()),
            ParamValue::uint(pi::RESTART_POINT, restart_point),
        ]),
    ))
}

/// DTF: append and account; no acknowledgement, debounced journal update.
async fn handle_dtf(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    if fpdu.payload.len() > deps.config.max_entity_size {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MALFORMED_FPDU,
            format!(
                "DTF payload of {} bytes exceeds the {}-byte entity limit",
                fpdu.payload.len(),
                deps.config.max_entity_size
            ),
        ));
    }

    let Some(transfer) = session.transfer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "DTF without an open transfer".to_owned(),
        ));
    };
    let Some(writer) = transfer.writer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "DTF before WRITE".to_owned(),
        ));
    };

    writer.append(&fpdu.payload).await?;
    transfer.bytes_transferred += fpdu.payload.len() as u64;
    transfer.record_count += 1;
    transfer.unflushed_bytes += fpdu.payload.len() as u64;

    if transfer.unflushed_bytes >= PROGRESS_FLUSH_BYTES {
        deps.journal
            .update_progress(&transfer.record_id, transfer.bytes_transferred)
            .await?;
        transfer.unflushed_bytes = 0;
    }

    Ok(HandlerAction::NoReply)
}

/// SYN: flush durable, persist the position, echo the number.
async fn handle_syn(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    let Some(number) = fpdu.param_uint(pi::SYNC_POINT_NUMBER) else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MISSING_PARAMETER,
            "SYN without PI_20".to_owned(),
        ));
    };

    let Some(transfer) = session.transfer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "SYN without an open transfer".to_owned(),
        ));
    };
    let Some(writer) = transfer.writer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "SYN before WRITE".to_owned(),
        ));
    };

    writer.sync().await?;
    let position = writer.bytes_written();
    transfer.last_sync_point = position;
    transfer.sync_point_count += 1;
    deps.journal
        .record_sync_point(&transfer.record_id, position)
        .await?;
    debug!(
        session = %session.session_id,
        sync_point = number,
        position,
        "sync point acknowledged"
    );

    session.set_state(SessionState::Tde02bReceivingData);
    Ok(HandlerAction::Reply(
        session.reply(FpduKind::AckSyn).with_params(vec![
            ParamValue::bytes(pi::DIAGNOSTIC, DiagnosticCode::SUCCESS.to_bytes()),
            ParamValue::uint(pi::SYNC_POINT_NUMBER, number),
        ]),
    ))
}

/// RESYN: peer asks to restart from an earlier byte position. Only legal
/// when resynchronization was negotiated, and never past data we already
/// acknowledged durably.
async fn handle_resyn(session: &mut Session, fpdu: &Fpdu) -> Result<HandlerAction, SessionError> {
    if !session.resync_enabled {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "RESYN without negotiated resynchronization".to_owned(),
        ));
    }
    let Some(position) = fpdu.param_uint(pi::RESTART_POINT) else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MISSING_PARAMETER,
            "RESYN without PI_18".to_owned(),
        ));
    };

    let session_id = session.session_id.clone();
    let Some(transfer) = session.transfer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "RESYN without an open transfer".to_owned(),
        ));
    };
    let Some(writer) = transfer.writer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "RESYN before WRITE".to_owned(),
        ));
    };

    if position > writer.bytes_written() {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MALFORMED_FPDU,
            format!("RESYN to {position} beyond {} received bytes", writer.bytes_written()),
        ));
    }
    writer.truncate_to(position).await?;
    transfer.bytes_transferred = position;
    info!(session = %session_id, position, "resynchronized");

    session.set_state(SessionState::Tde02bReceivingData);
    Ok(HandlerAction::Reply(
        session.reply(FpduKind::AckResyn).with_params(vec![
            ParamValue::bytes(pi::DIAGNOSTIC, DiagnosticCode::SUCCESS.to_bytes()),
            ParamValue::uint(pi::RESTART_POINT, position),
        ]),
    ))
}

/// DTF_END: flush and close the output handle; the transfer is finalized
/// by the TRANS_END that follows.
async fn handle_dtf_end(session: &mut Session, fpdu: &Fpdu) -> Result<HandlerAction, SessionError> {
    let Some(transfer) = session.transfer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "DTF_END without an open transfer".to_owned(),
        ));
    };
    let Some(mut writer) = transfer.writer.take() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "DTF_END before WRITE".to_owned(),
        ));
    };

    if !fpdu.payload.is_empty() {
        writer.append(&fpdu.payload).await?;
        transfer.bytes_transferred += fpdu.payload.len() as u64;
        transfer.record_count += 1;
    }
    let (bytes, checksum) = writer.finish().await?;
    transfer.bytes_transferred = bytes;
    transfer.checksum = Some(checksum);

    Ok(HandlerAction::NoReply)
}

/// TRANS_END: finalize the journal record and report totals.
async fn handle_trans_end(
    session: &mut Session,
    deps: &SessionDeps,
) -> Result<HandlerAction, SessionError> {
    let Some(transfer) = session.transfer.take() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "TRANS_END without a transfer".to_owned(),
        ));
    };

    deps.journal
        .complete_transfer(
            &transfer.record_id,
            transfer.bytes_transferred,
            transfer.checksum.as_deref(),
        )
        .await?;
    deps.audit
        .record(
            AuditEvent::new(AuditCategory::Transfer, "TRANSFER_COMPLETE", AuditOutcome::Success)
                .session(&session.session_id)
                .partner(session.partner_id.as_deref().unwrap_or("-"))
                .transfer(&transfer.record_id)
                .filename(&transfer.filename)
                .bytes(transfer.bytes_transferred),
        )
        .await?;
    info!(
        session = %session.session_id,
        transfer = %transfer.record_id,
        bytes = transfer.bytes_transferred,
        records = transfer.record_count,
        "transfer complete"
    );

    session.set_state(SessionState::Of02TransferReady);
    Ok(HandlerAction::Reply(
        session.reply(FpduKind::AckTransEnd).with_params(vec![
            ParamValue::bytes(pi::DIAGNOSTIC, DiagnosticCode::SUCCESS.to_bytes()),
            ParamValue::uint(pi::BYTE_COUNT, transfer.bytes_transferred),
            ParamValue::uint(pi::RECORD_COUNT, transfer.record_count),
        ]),
    ))
}
