//! Protocol handlers and their dispatch table.
//!
//! Each handler module owns one phase of the protocol and declares the
//! FPDU kinds it accepts (`KINDS`). Dispatch is an explicit static table
//! from kind to handler, so the routing is inspectable and testable; the
//! state machine has already validated legality before a handler runs.

pub mod connection;
pub mod message;
pub mod open;
pub mod receive;
pub mod selection;
pub mod send;

use crate::session::{Session, SessionDeps, SessionError};
use pesit_core::{DiagnosticCode, Fpdu, FpduKind};

/// What the session loop does with a handler's result.
pub enum HandlerAction {
    /// Emit one response FPDU.
    Reply(Fpdu),
    /// Data-bearing path: nothing to emit.
    NoReply,
    /// Emit the response, then close the transport (orderly end).
    ReplyThenClose(Fpdu),
    /// Emit the acknowledgement, then drive the server-side send loop.
    StartSend(Fpdu),
    /// Protocol failure: emit ABORT with this diagnostic and close.
    Abort(DiagnosticCode, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerId {
    Connection,
    Selection,
    OpenClose,
    Receive,
    Send,
    Message,
}

/// The dispatch table: every client-initiated FPDU kind and the handler
/// responsible for it.
pub const DISPATCH: &[(FpduKind, HandlerId)] = &[
    (FpduKind::Connect, HandlerId::Connection),
    (FpduKind::Release, HandlerId::Connection),
    (FpduKind::Create, HandlerId::Selection),
    (FpduKind::Select, HandlerId::Selection),
    (FpduKind::Deselect, HandlerId::Selection),
    (FpduKind::Open, HandlerId::OpenClose),
    (FpduKind::Close, HandlerId::OpenClose),
    (FpduKind::Write, HandlerId::Receive),
    (FpduKind::Dtf, HandlerId::Receive),
    (FpduKind::DtfEnd, HandlerId::Receive),
    (FpduKind::Syn, HandlerId::Receive),
    (FpduKind::Resyn, HandlerId::Receive),
    (FpduKind::TransEnd, HandlerId::Receive),
    (FpduKind::Read, HandlerId::Send),
    (FpduKind::Msg, HandlerId::Message),
    (FpduKind::Msgdm, HandlerId::Message),
    (FpduKind::Msgmm, HandlerId::Message),
    (FpduKind::Msgfm, HandlerId::Message),
];

pub fn handler_for(kind: FpduKind) -> Option<HandlerId> {
    DISPATCH
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

/// Route an FPDU to its handler. The state machine has already accepted
/// the (state, kind) pair.
pub async fn dispatch(
    session: &mut Session,
    deps: &SessionDeps,
    fpdu: &Fpdu,
) -> Result<HandlerAction, SessionError> {
    match handler_for(fpdu.kind) {
        Some(HandlerId::Connection) => connection::handle(session, deps, fpdu).await,
        Some(HandlerId::Selection) => selection::handle(session, deps, fpdu).await,
        Some(HandlerId::OpenClose) => open::handle(session, deps, fpdu).await,
        Some(HandlerId::Receive) => receive::handle(session, deps, fpdu).await,
        Some(HandlerId::Send) => send::handle(session, deps, fpdu).await,
        Some(HandlerId::Message) => message::handle(session, deps, fpdu).await,
        None => Ok(HandlerAction::Abort(
            DiagnosticCode::UNKNOWN_FPDU,
            format!("{} is not a client-initiated FPDU", fpdu.kind),
        )),
    }
}
