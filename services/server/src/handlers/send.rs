//! Send-side data transfer: READ acknowledgement and the server-driven
//! DTF/SYN emission loop.
//!
//! The send loop is strictly serial: after every SYN the server waits for
//! the peer's ACK_SYN (bounded by the read timeout) before emitting more
//! data, and after TRANS_END it waits for ACK_TRANS_END.

use super::HandlerAction;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome};
use crate::files::{FileError, FileReader};
use crate::session::{Session, SessionDeps, SessionError};
use crate::state::SessionState;
use crate::transport::IoStream;
use futures_util::{SinkExt, StreamExt};
use pesit_core::{DiagnosticCode, Fpdu, FpduCodec, FpduKind, ParamValue, pi};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio_util::codec::Framed;
use tracing::{debug, info};

pub const KINDS: &[FpduKind] = &[FpduKind::Read];

pub async fn handle(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    match fpdu.kind {
        FpduKind::Read => handle_read(session, deps).await,
        other => Ok(HandlerAction::Abort(
            DiagnosticCode::UNKNOWN_FPDU,
            format!("{other} routed to the send handler"),
        )),
    }
}

/// READ: open the source file and acknowledge; the session loop then runs
/// `run_send` to stream the data.
async fn handle_read(
    session: &mut Session,
    deps: &SessionDeps,
) -> Result<HandlerAction, SessionError> {
    let Some(transfer) = session.transfer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            "READ without a selected file".to_owned(),
        ));
    };

    let reader = match FileReader::open(
        &transfer.local_path,
        transfer.max_entity_size,
        transfer.start_byte,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            // NACK: the journal record fails, the session itself survives.
            let diag = match e {
                FileError::NotFound(_) => DiagnosticCode::FILE_NOT_FOUND,
                _ => DiagnosticCode::DIR_NOT_WRITABLE,
            };
            let record_id = transfer.record_id.clone();
            let filename = transfer.filename.clone();
            session.transfer = None;
            deps.journal
                .fail_transfer(&record_id, &diag.to_string(), &e.to_string())
                .await?;
            deps.audit
                .record(
                    AuditEvent::new(AuditCategory::Transfer, "TRANSFER_FAILED", AuditOutcome::Failure)
                        .session(&session.session_id)
                        .transfer(&record_id)
                        .filename(&filename)
                        .error(&diag.to_string(), &e.to_string()),
                )
                .await?;
            session.set_state(SessionState::Of02TransferReady);
            return Ok(HandlerAction::Reply(session.reply_diag(FpduKind::AckRead, diag)));
        }
    };

    let restart_point = transfer.start_byte;
    transfer.file_size = reader.file_size();
    transfer.reader = Some(reader);
    session.set_state(SessionState::Tdl02bSendingData);

    Ok(HandlerAction::StartSend(
        session.reply(FpduKind::AckRead).with_params(vec![
            ParamValue::bytes(pi::DIAGNOSTIC, DiagnosticCode::SUCCESS.to_bytes()),
            ParamValue::uint(pi::RESTART_POINT, restart_point),
        ]),
    ))
}

/// Stream the whole file: DTF frames bounded by the entity size, SYN at
/// the negotiated interval with a strict wait for ACK_SYN, then
/// DTF_END / TRANS_END / ACK_TRANS_END.
pub async fn run_send(
    framed: &mut Framed<IoStream, FpduCodec>,
    session: &mut Session,
    deps: &SessionDeps,
) -> Result<(), SessionError> {
    let read_timeout = Duration::from_millis(deps.config.read_timeout_ms);
    let sync_interval_bytes = if session.sync_points_enabled {
        u64::from(session.sync_interval_kb) * 1024
    } else {
        0
    };

    let Some(transfer) = session.transfer.as_mut() else {
        return Err(SessionError::SyncProtocol("send loop without a transfer".to_owned()));
    };
    let Some(mut reader) = transfer.reader.take() else {
        return Err(SessionError::SyncProtocol("send loop without a reader".to_owned()));
    };

    let record_id = transfer.record_id.clone();
    let filename = transfer.filename.clone();
    let destination = session.client_connection_id;
    let source = session.server_connection_id;

    let mut hasher = Sha256::new();
    let mut bytes_sent = transfer.start_byte;
    let mut since_sync = 0u64;
    let mut sync_number = 0u32;
    let mut records = 0u64;

    while let Some(chunk) = reader.next_chunk().await? {
        hasher.update(&chunk);
        bytes_sent += chunk.len() as u64;
        since_sync += chunk.len() as u64;
        records += 1;
        framed
            .send(Fpdu::new(FpduKind::Dtf, destination, source).with_payload(chunk))
            .await?;

        if sync_interval_bytes > 0 && since_sync >= sync_interval_bytes {
            sync_number += 1;
            since_sync = 0;
            framed
                .send(
                    Fpdu::new(FpduKind::Syn, destination, source)
                        .with_params(vec![ParamValue::uint(pi::SYNC_POINT_NUMBER, u64::from(sync_number))]),
                )
                .await?;
            await_ack(
                framed,
                session,
                deps,
                &record_id,
                read_timeout,
                FpduKind::AckSyn,
                Some(sync_number),
            )
            .await?;
            deps.journal.record_sync_point(&record_id, bytes_sent).await?;
            if let Some(t) = session.transfer.as_mut() {
                t.last_sync_point = bytes_sent;
                t.sync_point_count += 1;
                t.bytes_transferred = bytes_sent;
            }
            debug!(session = %session.session_id, sync_point = sync_number, bytes_sent, "sync acknowledged");
        }
    }

    framed
        .send(Fpdu::new(FpduKind::DtfEnd, destination, source))
        .await?;
    framed
        .send(Fpdu::new(FpduKind::TransEnd, destination, source).with_params(vec![
            ParamValue::uint(pi::BYTE_COUNT, bytes_sent),
            ParamValue::uint(pi::RECORD_COUNT, records),
        ]))
        .await?;
    session.set_state(SessionState::Tdl07ReadEnd);

    await_ack(
        framed,
        session,
        deps,
        &record_id,
        read_timeout,
        FpduKind::AckTransEnd,
        None,
    )
    .await?;

    let checksum = hex::encode(hasher.finalize());
    session.transfer = None;
    deps.journal
        .complete_transfer(&record_id, bytes_sent, Some(&checksum))
        .await?;
    deps.audit
        .record(
            AuditEvent::new(AuditCategory::Transfer, "TRANSFER_COMPLETE", AuditOutcome::Success)
                .session(&session.session_id)
                .partner(session.partner_id.as_deref().unwrap_or("-"))
                .transfer(&record_id)
                .filename(&filename)
                .bytes(bytes_sent),
        )
        .await?;
    info!(
        session = %session.session_id,
        transfer = %record_id,
        bytes = bytes_sent,
        records,
        "send complete"
    );

    session.set_state(SessionState::Of02TransferReady);
    Ok(())
}

/// Wait for one specific acknowledgement from the peer. A timeout fails
/// the transfer (the peer is alive but not cooperating); a disconnect is
/// left to the caller's interrupt path.
async fn await_ack(
    framed: &mut Framed<IoStream, FpduCodec>,
    session: &mut Session,
    deps: &SessionDeps,
    record_id: &str,
    read_timeout: Duration,
    expected: FpduKind,
    expected_number: Option<u32>,
) -> Result<(), SessionError> {
    let frame = match tokio::time::timeout(read_timeout, framed.next()).await {
        Err(_) => {
            session.transfer = None;
            deps.journal
                .fail_transfer(
                    record_id,
                    &DiagnosticCode::SYNC_TIMEOUT.to_string(),
                    &format!("timed out waiting for {expected}"),
                )
                .await?;
            return Err(SessionError::SyncProtocol(format!(
                "no {expected} within {}ms",
                read_timeout.as_millis()
            )));
        }
        Ok(None) => return Err(SessionError::ConnectionClosed),
        Ok(Some(Err(e))) => return Err(SessionError::Codec(e)),
        Ok(Some(Ok(frame))) => frame,
    };

    if frame.kind == FpduKind::Abort {
        session.aborted = true;
        return Err(SessionError::ConnectionClosed);
    }
    if frame.kind != expected {
        session.transfer = None;
        deps.journal
            .fail_transfer(
                record_id,
                &DiagnosticCode::SYNC_TIMEOUT.to_string(),
                &format!("expected {expected}, peer sent {}", frame.kind),
            )
            .await?;
        return Err(SessionError::SyncProtocol(format!(
            "expected {expected}, got {}",
            frame.kind
        )));
    }
    if let Some(number) = expected_number {
        let echoed = frame.param_uint(pi::SYNC_POINT_NUMBER);
        if echoed != Some(u64::from(number)) {
            session.transfer = None;
            deps.journal
                .fail_transfer(
                    record_id,
                    &DiagnosticCode::SYNC_TIMEOUT.to_string(),
                    &format!("ACK_SYN echoed {:?}, expected {}", echoed, number),
                )
                .await?;
            return Err(SessionError::SyncProtocol(format!(
                "ACK_SYN out of order: {:?} != {}",
                echoed, number
            )));
        }
    }
    Ok(())
}
