//! Message handler: short MSG and the segmented MSGDM/MSGMM/MSGFM flow.
//!
//! Segments accumulate in the session's reassembly buffer; one ACK_MSG
//! acknowledges the whole message. The buffer is bounded.

use super::HandlerAction;
use crate::session::{MAX_MESSAGE_SIZE, Session, SessionDeps, SessionError};
use crate::state::SessionState;
use pesit_core::{DiagnosticCode, Fpdu, FpduKind, pi};
use tracing::info;

pub const KINDS: &[FpduKind] = &[
    FpduKind::Msg,
    FpduKind::Msgdm,
    FpduKind::Msgmm,
    FpduKind::Msgfm,
];

pub async fn handle(
    session: &mut Session,
    _deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    match fpdu.kind {
        FpduKind::Msg => handle_msg(session, fpdu),
        FpduKind::Msgdm => {
            session.message_buffer = Some(Vec::new());
            append_segment(session, fpdu)
        }
        FpduKind::Msgmm => append_segment(session, fpdu),
        FpduKind::Msgfm => {
            if let HandlerAction::Abort(d, r) = append_segment(session, fpdu)? {
                return Ok(HandlerAction::Abort(d, r));
            }
            let message = session.message_buffer.take().unwrap_or_default();
            info!(
                session = %session.session_id,
                bytes = message.len(),
                "segmented message received"
            );
            session.set_state(SessionState::Cn03Connected);
            Ok(HandlerAction::Reply(
                session.reply_diag(FpduKind::AckMsg, DiagnosticCode::SUCCESS),
            ))
        }
        other => Ok(HandlerAction::Abort(
            DiagnosticCode::UNKNOWN_FPDU,
            format!("{other} routed to the message handler"),
        )),
    }
}

fn handle_msg(session: &mut Session, fpdu: &Fpdu) -> Result<HandlerAction, SessionError> {
    let content = message_content(fpdu);
    if content.is_none() {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MISSING_PARAMETER,
            "MSG without PI_91 or PI_99".to_owned(),
        ));
    }
    info!(
        session = %session.session_id,
        bytes = content.map(<[u8]>::len).unwrap_or(0),
        "message received"
    );
    Ok(HandlerAction::Reply(
        session.reply_diag(FpduKind::AckMsg, DiagnosticCode::SUCCESS),
    ))
}

fn append_segment(session: &mut Session, fpdu: &Fpdu) -> Result<HandlerAction, SessionError> {
    let Some(segment) = message_content(fpdu) else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MISSING_PARAMETER,
            format!("{} without PI_91 or PI_99", fpdu.kind),
        ));
    };
    let Some(buffer) = session.message_buffer.as_mut() else {
        return Ok(HandlerAction::Abort(
            DiagnosticCode::INVALID_TRANSITION,
            format!("{} without a message in progress", fpdu.kind),
        ));
    };
    if buffer.len() + segment.len() > MAX_MESSAGE_SIZE {
        session.message_buffer = None;
        return Ok(HandlerAction::Abort(
            DiagnosticCode::MALFORMED_FPDU,
            format!("reassembled message exceeds {MAX_MESSAGE_SIZE} bytes"),
        ));
    }
    buffer.extend_from_slice(segment);
    Ok(HandlerAction::NoReply)
}

fn message_content(fpdu: &Fpdu) -> Option<&[u8]> {
    fpdu.param(pi::MESSAGE)
        .or_else(|| fpdu.param(pi::FREE_MESSAGE))
        .and_then(|p| p.as_bytes())
}
