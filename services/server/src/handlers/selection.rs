//! File-selection handler: CREATE, SELECT, DESELECT.
//!
//! CREATE prepares a receive (the peer writes to us), SELECT a send (the
//! peer reads from us). Both resolve the logical file, build the transfer
//! context, and open a journal record. Refusals are NACKs with a nonzero
//! diagnostic: the session stays usable and the peer may try another file.

use super::HandlerAction;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome};
use crate::session::{Session, SessionDeps, SessionError, TransferContext};
use crate::state::SessionState;
use crate::storage::journal::{Direction, NewTransfer};
use pesit_core::{DiagnosticCode, Fpdu, FpduKind, ParamValue, pgi, pi};
use std::path::PathBuf;
use tracing::info;

pub const KINDS: &[FpduKind] = &[FpduKind::Create, FpduKind::Select, FpduKind::Deselect];

pub async fn handle(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    match fpdu.kind {
        FpduKind::Create => select_file(session, deps, fpdu, Direction::Receive).await,
        FpduKind::Select => select_file(session, deps, fpdu, Direction::Send).await,
        FpduKind::Deselect => handle_deselect(session, deps).await,
        other => Ok(HandlerAction::Abort(
            DiagnosticCode::UNKNOWN_FPDU,
            format!("{other} routed to the selection handler"),
        )),
    }
}

async fn select_file(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
    direction: Direction,
) -> Result<HandlerAction, SessionError> {
    let ack_kind = match direction {
        Direction::Receive => FpduKind::AckCreate,
        Direction::Send => FpduKind::AckSelect,
    };

    let Some(filename) = fpdu
        .group_param(pgi::FILE_ID, pi::FILENAME)
        .and_then(|p| p.as_str())
        .map(str::to_owned)
    else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MISSING_PARAMETER,
            "file selection without PI_12 in PGI_09".to_owned(),
        ));
    };

    // The virtual filename must not escape the transfer directories.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return nack(session, deps, ack_kind, &filename, DiagnosticCode::FILE_NOT_FOUND,
            "filename escapes the transfer directory").await;
    }

    let logical = deps.directory.resolve_file(&filename).cloned();
    if logical.is_none() && deps.config.strict_file_check {
        return nack(session, deps, ack_kind, &filename, DiagnosticCode::FILE_NOT_FOUND,
            "no logical file matches").await;
    }

    let base = match direction {
        Direction::Receive => &deps.config.receive_directory,
        Direction::Send => &deps.config.send_directory,
    };
    let mut local_path: PathBuf = base.clone();
    if let Some(sub) = logical.as_ref().and_then(|f| f.directory.clone()) {
        local_path.push(sub);
    }
    local_path.push(&filename);

    // A send needs an existing physical file; capture its size and mtime.
    let mut file_size = 0u64;
    let mut modified = None;
    if direction == Direction::Send {
        match tokio::fs::metadata(&local_path).await {
            Ok(meta) => {
                file_size = meta.len();
                modified = meta.modified().ok().map(format_timestamp);
            }
            Err(_) => {
                return nack(session, deps, ack_kind, &filename, DiagnosticCode::FILE_NOT_FOUND,
                    "physical file missing").await;
            }
        }
    }

    let record_format = fpdu
        .group_param(pgi::LOGICAL_ATTRS, pi::RECORD_FORMAT)
        .and_then(|p| p.as_str())
        .map(str::to_owned)
        .or_else(|| logical.as_ref().map(|f| f.record_format.clone()))
        .unwrap_or_else(|| "V".to_owned());
    let record_length = fpdu
        .group_param(pgi::LOGICAL_ATTRS, pi::RECORD_LENGTH)
        .and_then(|p| p.as_uint())
        .map(|v| v as u32)
        .or_else(|| logical.as_ref().map(|f| f.record_length))
        .unwrap_or(0);
    let max_reservation = fpdu
        .group_param(pgi::PHYSICAL_ATTRS, pi::MAX_RESERVATION)
        .and_then(|p| p.as_uint())
        .unwrap_or(0);
    let file_type = fpdu.param_uint(pi::FILE_TYPE).unwrap_or(0) as u32;
    let peer_transfer_id = fpdu
        .group_param(pgi::FILE_ID, pi::TRANSFER_ID)
        .and_then(|p| p.as_uint())
        .unwrap_or(0);
    let creation_date = fpdu
        .group_param(pgi::HISTORICAL_ATTRS, pi::CREATION_DATE)
        .and_then(|p| p.as_str())
        .map(str::to_owned);
    let max_entity_size = match fpdu.param_uint(pi::MAX_ENTITY_SIZE) {
        Some(peer_max) if peer_max > 0 => (peer_max as usize).min(deps.config.max_entity_size),
        _ => deps.config.max_entity_size,
    };

    let partner_id = session.partner_id.clone().unwrap_or_default();

    // A reconnecting peer resumes through a pending retry record when one
    // exists; otherwise this is a fresh transfer.
    let (record_id, start_byte) = match direction {
        Direction::Receive => {
            match deps
                .journal
                .claim_retry(
                    &deps.config.server_id,
                    &partner_id,
                    &filename,
                    &session.session_id,
                    &deps.node_id,
                )
                .await?
            {
                Some(record) => (record.transfer_id, record.start_byte),
                None => {
                    let id = deps
                        .journal
                        .create_transfer(NewTransfer {
                            session_id: &session.session_id,
                            server_id: &deps.config.server_id,
                            node_id: &deps.node_id,
                            partner_id: &partner_id,
                            filename: &filename,
                            direction,
                            remote_address: Some(&session.remote_addr.to_string()),
                        })
                        .await?;
                    (id, 0)
                }
            }
        }
        Direction::Send => {
            let id = deps
                .journal
                .create_transfer(NewTransfer {
                    session_id: &session.session_id,
                    server_id: &deps.config.server_id,
                    node_id: &deps.node_id,
                    partner_id: &partner_id,
                    filename: &filename,
                    direction,
                    remote_address: Some(&session.remote_addr.to_string()),
                })
                .await?;
            (id, 0)
        }
    };

    info!(
        session = %session.session_id,
        transfer = %record_id,
        filename = %filename,
        direction = direction.as_str(),
        start_byte,
        "file selected"
    );
    deps.audit
        .record(
            AuditEvent::new(AuditCategory::Transfer, "TRANSFER_INITIATED", AuditOutcome::Success)
                .session(&session.session_id)
                .partner(&partner_id)
                .transfer(&record_id)
                .filename(&filename),
        )
        .await?;

    session.transfer = Some(TransferContext {
        record_id,
        filename: filename.clone(),
        file_type,
        record_format: record_format.clone(),
        record_length,
        max_reservation,
        local_path,
        direction,
        bytes_transferred: start_byte,
        record_count: 0,
        last_sync_point: start_byte,
        sync_point_count: 0,
        start_byte,
        unflushed_bytes: 0,
        file_size,
        peer_transfer_id,
        creation_date,
        max_entity_size,
        writer: None,
        reader: None,
        checksum: None,
    });
    session.set_state(SessionState::Sf03FileSelected);

    // ACK_SELECT must carry all four attribute groups; ACK_CREATE echoes
    // the identification group.
    let mut params = vec![
        ParamValue::bytes(pi::DIAGNOSTIC, DiagnosticCode::SUCCESS.to_bytes()),
        ParamValue::group(
            pgi::FILE_ID,
            vec![
                ParamValue::string(pi::FILENAME, &filename),
                ParamValue::uint(pi::TRANSFER_ID, peer_transfer_id),
            ],
        ),
        ParamValue::group(
            pgi::LOGICAL_ATTRS,
            vec![
                ParamValue::string(pi::RECORD_FORMAT, &record_format),
                ParamValue::uint(pi::RECORD_LENGTH, u64::from(record_length)),
            ],
        ),
    ];
    if direction == Direction::Send {
        params.push(ParamValue::group(
            pgi::PHYSICAL_ATTRS,
            vec![ParamValue::uint(pi::FILE_SIZE, file_size)],
        ));
        params.push(ParamValue::group(
            pgi::HISTORICAL_ATTRS,
            vec![ParamValue::string(
                pi::MODIFICATION_DATE,
                &modified.unwrap_or_else(|| "00000000000000".to_owned()),
            )],
        ));
    } else {
        params.push(ParamValue::group(
            pgi::PHYSICAL_ATTRS,
            vec![ParamValue::uint(pi::MAX_RESERVATION, max_reservation)],
        ));
        params.push(ParamValue::group(pgi::HISTORICAL_ATTRS, vec![]));
    }

    Ok(HandlerAction::Reply(session.reply(ack_kind).with_params(params)))
}

async fn nack(
    session: &mut Session,
    deps: &SessionDeps,
    ack_kind: FpduKind,
    filename: &str,
    diag: DiagnosticCode,
    reason: &str,
) -> Result<HandlerAction, SessionError> {
    deps.audit
        .record(
            AuditEvent::new(AuditCategory::Transfer, "FILE_REFUSED", AuditOutcome::Denied)
                .session(&session.session_id)
                .partner(session.partner_id.as_deref().unwrap_or("-"))
                .filename(filename)
                .error(&diag.to_string(), reason),
        )
        .await?;
    info!(
        session = %session.session_id,
        filename,
        diagnostic = %diag,
        reason,
        "file selection refused"
    );
    session.set_state(SessionState::Cn03Connected);
    Ok(HandlerAction::Reply(session.reply_diag(ack_kind, diag)))
}

async fn handle_deselect(
    session: &mut Session,
    deps: &SessionDeps,
) -> Result<HandlerAction, SessionError> {
    if let Some(transfer) = session.transfer.take() {
        // A record that never reached OPEN is cancelled, not left dangling.
        let record = deps.journal.get(&transfer.record_id).await?;
        if record.status == crate::storage::journal::TransferStatus::Initiated {
            deps.journal
                .cancel_transfer(&transfer.record_id, "deselected before open")
                .await?;
        }
    }
    session.set_state(SessionState::Cn03Connected);
    Ok(HandlerAction::Reply(
        session.reply_diag(FpduKind::AckDeselect, DiagnosticCode::SUCCESS),
    ))
}

/// `SystemTime` to the PeSIT date form YYYYMMDDHHMMSS.
fn format_timestamp(time: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%Y%m%d%H%M%S")
        .to_string()
}
