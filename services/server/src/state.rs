//! The per-session protocol state machine.
//!
//! Legal transitions are a static property of the state enum: `valid_next`
//! lists every state reachable from a given state, and `transition_for`
//! maps (state, incoming FPDU kind) to the state the session enters while
//! handling that FPDU. Anything outside these tables is an invalid
//! transition and is converted into ABORT with D2_203 by the runtime.

use pesit_core::FpduKind;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    // Connection phase
    Cn01Repos,
    Cn02bConnectPending,
    Cn03Connected,
    Cn04bReleasePending,
    // File selection
    Sf01bCreatePending,
    Sf02bSelectPending,
    Sf03FileSelected,
    Sf04bDeselectPending,
    // File open
    Of01bOpenPending,
    Of02TransferReady,
    Of03bClosePending,
    // Transfer, receive side
    Tde01bWritePending,
    Tde02bReceivingData,
    Tde03ResyncPending,
    Tde07WriteEnd,
    // Transfer, send side
    Tdl01bReadPending,
    Tdl02bSendingData,
    Tdl07ReadEnd,
    // Messages
    MsgReceiving,
    // Error sink
    Error,
}

use SessionState::*;

impl SessionState {
    /// States reachable from `self`. `Error` is reachable from every state
    /// and is therefore not repeated in each set.
    pub fn valid_next(self) -> &'static [SessionState] {
        match self {
            Cn01Repos => &[Cn02bConnectPending],
            Cn02bConnectPending => &[Cn03Connected, Cn01Repos],
            Cn03Connected => &[
                Sf01bCreatePending,
                Sf02bSelectPending,
                Cn04bReleasePending,
                Cn03Connected,
                MsgReceiving,
            ],
            Cn04bReleasePending => &[Cn01Repos],
            Sf01bCreatePending => &[Sf03FileSelected, Cn03Connected],
            Sf02bSelectPending => &[Sf03FileSelected, Cn03Connected],
            Sf03FileSelected => &[Of01bOpenPending, Sf04bDeselectPending],
            Sf04bDeselectPending => &[Cn03Connected],
            Of01bOpenPending => &[Of02TransferReady, Sf03FileSelected],
            Of02TransferReady => &[
                Tde01bWritePending,
                Tdl01bReadPending,
                Of03bClosePending,
            ],
            Of03bClosePending => &[Sf03FileSelected],
            Tde01bWritePending => &[Tde02bReceivingData, Of02TransferReady],
            Tde02bReceivingData => &[
                Tde02bReceivingData,
                Tde03ResyncPending,
                Tde07WriteEnd,
            ],
            Tde03ResyncPending => &[Tde02bReceivingData],
            Tde07WriteEnd => &[Of02TransferReady],
            Tdl01bReadPending => &[Tdl02bSendingData, Of02TransferReady],
            Tdl02bSendingData => &[Tdl02bSendingData, Tdl07ReadEnd],
            Tdl07ReadEnd => &[Of02TransferReady],
            MsgReceiving => &[MsgReceiving, Cn03Connected],
            Error => &[Cn01Repos],
        }
    }

    /// The state entered while handling an incoming FPDU of `kind`, or
    /// `None` when the FPDU is illegal in this state.
    ///
    /// ABORT is accepted everywhere and handled by the runtime directly,
    /// so it does not appear here.
    pub fn transition_for(self, kind: FpduKind) -> Option<SessionState> {
        use FpduKind::*;
        let next = match (self, kind) {
            (Cn01Repos, Connect) => Cn02bConnectPending,
            (Cn03Connected, Create) => Sf01bCreatePending,
            (Cn03Connected, Select) => Sf02bSelectPending,
            (Cn03Connected, Release) => Cn04bReleasePending,
            (Cn03Connected, Msg) => Cn03Connected,
            (Cn03Connected, Msgdm) => MsgReceiving,
            (MsgReceiving, Msgmm) => MsgReceiving,
            (MsgReceiving, Msgfm) => Cn03Connected,
            (Sf03FileSelected, Open) => Of01bOpenPending,
            (Sf03FileSelected, Deselect) => Sf04bDeselectPending,
            (Of02TransferReady, Write) => Tde01bWritePending,
            (Of02TransferReady, Read) => Tdl01bReadPending,
            (Of02TransferReady, Close) => Of03bClosePending,
            (Tde02bReceivingData, Dtf) => Tde02bReceivingData,
            (Tde02bReceivingData, Syn) => Tde03ResyncPending,
            (Tde02bReceivingData, Resyn) => Tde03ResyncPending,
            (Tde02bReceivingData, DtfEnd) => Tde07WriteEnd,
            (Tde07WriteEnd, TransEnd) => Tde07WriteEnd,
            (Tdl02bSendingData, AckSyn) => Tdl02bSendingData,
            (Tdl07ReadEnd, AckTransEnd) => Tdl07ReadEnd,
            _ => return None,
        };
        Some(next)
    }

    /// True for the states a transfer is considered in flight.
    pub fn in_transfer(self) -> bool {
        matches!(
            self,
            Tde01bWritePending
                | Tde02bReceivingData
                | Tde03ResyncPending
                | Tde07WriteEnd
                | Tdl01bReadPending
                | Tdl02bSendingData
                | Tdl07ReadEnd
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cn01Repos => "CN01_REPOS",
            Cn02bConnectPending => "CN02B_CONNECT_PENDING",
            Cn03Connected => "CN03_CONNECTED",
            Cn04bReleasePending => "CN04B_RELEASE_PENDING",
            Sf01bCreatePending => "SF01B_CREATE_PENDING",
            Sf02bSelectPending => "SF02B_SELECT_PENDING",
            Sf03FileSelected => "SF03_FILE_SELECTED",
            Sf04bDeselectPending => "SF04B_DESELECT_PENDING",
            Of01bOpenPending => "OF01B_OPEN_PENDING",
            Of02TransferReady => "OF02_TRANSFER_READY",
            Of03bClosePending => "OF03B_CLOSE_PENDING",
            Tde01bWritePending => "TDE01B_WRITE_PENDING",
            Tde02bReceivingData => "TDE02B_RECEIVING_DATA",
            Tde03ResyncPending => "TDE03_RESYNC_PENDING",
            Tde07WriteEnd => "TDE07_WRITE_END",
            Tdl01bReadPending => "TDL01B_READ_PENDING",
            Tdl02bSendingData => "TDL02B_SENDING_DATA",
            Tdl07ReadEnd => "TDL07_READ_END",
            MsgReceiving => "MSG_RECEIVING",
            Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Every state, for table-driven tests.
pub const ALL_STATES: [SessionState; 20] = [
    Cn01Repos,
    Cn02bConnectPending,
    Cn03Connected,
    Cn04bReleasePending,
    Sf01bCreatePending,
    Sf02bSelectPending,
    Sf03FileSelected,
    Sf04bDeselectPending,
    Of01bOpenPending,
    Of02TransferReady,
    Of03bClosePending,
    Tde01bWritePending,
    Tde02bReceivingData,
    Tde03ResyncPending,
    Tde07WriteEnd,
    Tdl01bReadPending,
    Tdl02bSendingData,
    Tdl07ReadEnd,
    MsgReceiving,
    Error,
];

#[cfg(test)]
mod tests {
    use super::*;
    use pesit_core::FpduKind;

    #[test]
    fn connection_phase_paths() {
        assert_eq!(
            Cn01Repos.transition_for(FpduKind::Connect),
            Some(Cn02bConnectPending)
        );
        assert!(Cn02bConnectPending.valid_next().contains(&Cn03Connected));
        assert!(Cn02bConnectPending.valid_next().contains(&Cn01Repos));
        assert_eq!(
            Cn03Connected.transition_for(FpduKind::Release),
            Some(Cn04bReleasePending)
        );
        assert!(Cn04bReleasePending.valid_next().contains(&Cn01Repos));
    }

    #[test]
    fn selection_and_open_paths() {
        assert_eq!(
            Cn03Connected.transition_for(FpduKind::Create),
            Some(Sf01bCreatePending)
        );
        assert_eq!(
            Cn03Connected.transition_for(FpduKind::Select),
            Some(Sf02bSelectPending)
        );
        assert!(Sf01bCreatePending.valid_next().contains(&Sf03FileSelected));
        assert_eq!(
            Sf03FileSelected.transition_for(FpduKind::Open),
            Some(Of01bOpenPending)
        );
        assert!(Of01bOpenPending.valid_next().contains(&Of02TransferReady));
    }

    #[test]
    fn receive_path_cycles_on_dtf_and_ends_on_trans_end() {
        assert_eq!(
            Of02TransferReady.transition_for(FpduKind::Write),
            Some(Tde01bWritePending)
        );
        assert_eq!(
            Tde02bReceivingData.transition_for(FpduKind::Dtf),
            Some(Tde02bReceivingData)
        );
        assert_eq!(
            Tde02bReceivingData.transition_for(FpduKind::Syn),
            Some(Tde03ResyncPending)
        );
        assert!(Tde03ResyncPending.valid_next().contains(&Tde02bReceivingData));
        assert_eq!(
            Tde02bReceivingData.transition_for(FpduKind::DtfEnd),
            Some(Tde07WriteEnd)
        );
        assert!(Tde07WriteEnd.valid_next().contains(&Of02TransferReady));
    }

    #[test]
    fn send_path() {
        assert_eq!(
            Of02TransferReady.transition_for(FpduKind::Read),
            Some(Tdl01bReadPending)
        );
        assert!(Tdl01bReadPending.valid_next().contains(&Tdl02bSendingData));
        assert_eq!(
            Tdl02bSendingData.transition_for(FpduKind::AckSyn),
            Some(Tdl02bSendingData)
        );
        assert!(Tdl07ReadEnd.valid_next().contains(&Of02TransferReady));
    }

    #[test]
    fn message_reassembly_path() {
        assert_eq!(Cn03Connected.transition_for(FpduKind::Msg), Some(Cn03Connected));
        assert_eq!(
            Cn03Connected.transition_for(FpduKind::Msgdm),
            Some(MsgReceiving)
        );
        assert_eq!(MsgReceiving.transition_for(FpduKind::Msgmm), Some(MsgReceiving));
        assert_eq!(
            MsgReceiving.transition_for(FpduKind::Msgfm),
            Some(Cn03Connected)
        );
    }

    #[test]
    fn write_in_connected_state_is_illegal() {
        assert_eq!(Cn03Connected.transition_for(FpduKind::Write), None);
    }

    #[test]
    fn error_state_only_exits_to_repos() {
        assert_eq!(Error.valid_next(), &[Cn01Repos]);
    }

    /// Every (state, kind) pair that `transition_for` accepts must land in
    /// the predecessor's declared `valid_next` set (or stay in place).
    #[test]
    fn transition_targets_are_consistent_with_valid_next() {
        let kinds = [
            FpduKind::Connect,
            FpduKind::Release,
            FpduKind::Create,
            FpduKind::Select,
            FpduKind::Deselect,
            FpduKind::Open,
            FpduKind::Close,
            FpduKind::Write,
            FpduKind::Read,
            FpduKind::Dtf,
            FpduKind::DtfEnd,
            FpduKind::Syn,
            FpduKind::AckSyn,
            FpduKind::Resyn,
            FpduKind::TransEnd,
            FpduKind::AckTransEnd,
            FpduKind::Msg,
            FpduKind::Msgdm,
            FpduKind::Msgmm,
            FpduKind::Msgfm,
        ];
        for state in ALL_STATES {
            for kind in kinds {
                if let Some(next) = state.transition_for(kind) {
                    assert!(
                        next == state || state.valid_next().contains(&next),
                        "{state} --{kind}--> {next} not in valid_next"
                    );
                }
            }
        }
    }

    /// Data FPDUs are rejected in every non-receiving state.
    #[test]
    fn dtf_is_only_legal_while_receiving() {
        for state in ALL_STATES {
            let legal = state.transition_for(FpduKind::Dtf).is_some();
            assert_eq!(legal, state == Tde02bReceivingData, "{state}");
        }
    }
}
