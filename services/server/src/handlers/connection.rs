//! Connection-phase handler: CONNECT authentication and RELEASE.
//!
//! Validation order on CONNECT is fixed: partner existence and status,
//! requested server name, protocol version, password, access rights. The
//! first failure terminates with its diagnostic in an RCONNECT.

use super::HandlerAction;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome};
use crate::config::{PartnerAccess, PartnerConfig};
use crate::session::{Session, SessionDeps, SessionError, next_connection_id};
use crate::state::SessionState;
use pesit_core::{DiagnosticCode, Fpdu, FpduKind, ParamValue, pi};
use tracing::info;

pub const KINDS: &[FpduKind] = &[FpduKind::Connect, FpduKind::Release];

pub async fn handle(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    match fpdu.kind {
        FpduKind::Connect => handle_connect(session, deps, fpdu).await,
        FpduKind::Release => handle_release(session, deps).await,
        other => Ok(HandlerAction::Abort(
            DiagnosticCode::UNKNOWN_FPDU,
            format!("{other} routed to the connection handler"),
        )),
    }
}

async fn handle_connect(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    session.client_connection_id = fpdu.source;

    let Some(partner_id) = fpdu.param_str(pi::REQUESTER_ID).map(str::to_owned) else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MISSING_PARAMETER,
            "CONNECT without PI_03 requester id".to_owned(),
        ));
    };
    session.partner_id = Some(partner_id.clone());
    session.requested_server_id = fpdu.param_str(pi::SERVER_ID).map(str::to_owned);
    session.protocol_version = fpdu.param_uint(pi::VERSION).unwrap_or(0) as u8;
    session.access_type = fpdu.param_uint(pi::ACCESS_TYPE).unwrap_or(2) as u8;

    // 1. Partner existence and status.
    let partner = match deps.directory.find_partner(&partner_id) {
        Some(p) if !p.enabled => {
            return refuse(session, deps, DiagnosticCode::ACCESS_REFUSED, "partner disabled").await;
        }
        Some(p) => p.clone(),
        None if deps.config.strict_partner_check => {
            return refuse(session, deps, DiagnosticCode::UNKNOWN_PARTNER, "unknown partner").await;
        }
        // Lenient mode: an unknown partner gets an implicit record with no
        // password and full access.
        None => PartnerConfig {
            id: partner_id.clone(),
            enabled: true,
            password: None,
            access: PartnerAccess::Both,
        },
    };

    // 2. Requested server name must be this listener.
    if let Some(requested) = &session.requested_server_id {
        if !requested.eq_ignore_ascii_case(&deps.config.server_id) {
            return refuse(
                session,
                deps,
                DiagnosticCode::UNKNOWN_PARTNER,
                &format!("requested server '{requested}' is not this listener"),
            )
            .await;
        }
    }

    // 3. Protocol version: 0 means unspecified, otherwise ours or older.
    if session.protocol_version > deps.config.protocol_version {
        return refuse(
            session,
            deps,
            DiagnosticCode::VERSION_REFUSED,
            &format!("protocol version {} not supported", session.protocol_version),
        )
        .await;
    }

    // 4. Password.
    if let Some(stored) = &partner.password {
        let expected = deps.secrets.decrypt(stored)?;
        let provided = fpdu.param_str(pi::ACCESS_CONTROL).unwrap_or("");
        if provided != expected {
            return refuse(session, deps, DiagnosticCode::ACCESS_REFUSED, "bad credentials").await;
        }
    }

    // 5. Access rights.
    if !partner.access.allows(session.access_type) {
        return refuse(
            session,
            deps,
            DiagnosticCode::ACCESS_REFUSED,
            &format!("access type {} not granted", session.access_type),
        )
        .await;
    }

    // Option negotiation: sync points and resync only when both sides
    // agree; CRC as requested.
    let requested_sync = fpdu.param(pi::SYNC_OPTION).and_then(|p| {
        let bytes = p.as_bytes()?;
        (bytes.len() >= 2).then(|| u16::from_be_bytes([bytes[0], bytes[1]]))
    });
    if deps.config.sync_points_enabled {
        session.sync_points_enabled = true;
        session.sync_interval_kb = match requested_sync {
            Some(kb) if kb > 0 => u32::from(kb),
            _ => deps.config.sync_interval_kb,
        };
    }
    session.resync_enabled =
        deps.config.resync_enabled && fpdu.param_uint(pi::RESYNC).unwrap_or(0) == 1;
    session.crc_enabled = fpdu.param_uint(pi::CRC).unwrap_or(0) == 1;

    session.server_connection_id = next_connection_id();
    session.set_state(SessionState::Cn03Connected);

    deps.audit
        .record(
            AuditEvent::new(AuditCategory::Authentication, "SESSION_START", AuditOutcome::Success)
                .partner(&partner.id)
                .session(&session.session_id)
                .client_ip(&session.remote_addr.ip().to_string()),
        )
        .await?;
    info!(
        session = %session.session_id,
        partner = %partner.id,
        connection_id = session.server_connection_id,
        sync_interval_kb = session.sync_interval_kb,
        "session established"
    );
    session.partner = Some(partner);

    let version = if session.protocol_version == 0 {
        deps.config.protocol_version
    } else {
        session.protocol_version
    };
    let mut params = vec![
        ParamValue::bytes(pi::DIAGNOSTIC, DiagnosticCode::SUCCESS.to_bytes()),
        ParamValue::uint(pi::VERSION, u64::from(version)),
    ];
    if session.sync_points_enabled {
        let mut sync = (session.sync_interval_kb as u16).to_be_bytes().to_vec();
        sync.push(1);
        params.push(ParamValue::bytes(pi::SYNC_OPTION, sync));
    }
    if session.resync_enabled {
        params.push(ParamValue::uint(pi::RESYNC, 1));
    }
    if session.crc_enabled {
        params.push(ParamValue::uint(pi::CRC, 1));
    }
    Ok(HandlerAction::Reply(
        session.reply(FpduKind::Aconnect).with_params(params),
    ))
}

async fn refuse(
    session: &mut Session,
    deps: &SessionDeps,
    diag: DiagnosticCode,
    reason: &str,
) -> Result<HandlerAction, SessionError> {
    let mut event = AuditEvent::new(
        AuditCategory::Authentication,
        "SESSION_REFUSED",
        AuditOutcome::Failure,
    )
    .session(&session.session_id)
    .client_ip(&session.remote_addr.ip().to_string())
    .error(&diag.to_string(), reason);
    if let Some(partner) = &session.partner_id {
        event = event.partner(partner);
    }
    deps.audit.record(event).await?;
    info!(
        session = %session.session_id,
        partner = session.partner_id.as_deref().unwrap_or("-"),
        diagnostic = %diag,
        reason,
        "connection refused"
    );

    session.set_state(SessionState::Cn01Repos);
    Ok(HandlerAction::ReplyThenClose(
        session.reply_diag(FpduKind::Rconnect, diag),
    ))
}

async fn handle_release(
    session: &mut Session,
    deps: &SessionDeps,
) -> Result<HandlerAction, SessionError> {
    deps.audit
        .record(
            AuditEvent::new(AuditCategory::Authentication, "SESSION_END", AuditOutcome::Success)
                .session(&session.session_id)
                .partner(session.partner_id.as_deref().unwrap_or("-")),
        )
        .await?;
    let relconf = session.reply_diag(FpduKind::Relconf, DiagnosticCode::SUCCESS);
    session.set_state(SessionState::Cn01Repos);
    Ok(HandlerAction::ReplyThenClose(relconf))
}
