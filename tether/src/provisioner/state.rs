//! Kernel lifecycle states and the legal transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

/// Where a kernel binding is in its lifecycle.
///
/// Transitions are monotonic along the launch path; the only cycle-free
/// detour is the terminating arc, which is reachable from every
/// non-terminal state so an external kill can always proceed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelState {
    Pending,
    Authorized,
    Launching,
    AwaitingConnection,
    Discovering,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl KernelState {
    /// `true` once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool { matches!(self, Self::Terminated | Self::Failed) }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use KernelState::{
            Authorized, AwaitingConnection, Discovering, Failed, Launching, Pending, Running,
            Terminated, Terminating,
        };

        // Every non-terminal state may fail or be externally terminated.
        if !self.is_terminal() && (next == Failed || next == Terminating) {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Authorized)
                | (Authorized, Launching)
                | (Launching, AwaitingConnection)
                | (AwaitingConnection, Discovering)
                | (Discovering, Running)
                | (Terminating, Terminated)
        )
    }

    /// Validated transition; the caller keeps its current state on error.
    pub fn advance(self, next: Self) -> Result<Self, Error> {
        ensure!(self.can_transition_to(next), IllegalTransitionSnafu { from: self, to: next });
        Ok(next)
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Authorized => "AUTHORIZED",
            Self::Launching => "LAUNCHING",
            Self::AwaitingConnection => "AWAITING_CONNECTION",
            Self::Discovering => "DISCOVERING",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Illegal kernel state transition {from} -> {to}"))]
    IllegalTransition { from: KernelState, to: KernelState },
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAUNCH_PATH: &[KernelState] = &[
        KernelState::Pending,
        KernelState::Authorized,
        KernelState::Launching,
        KernelState::AwaitingConnection,
        KernelState::Discovering,
        KernelState::Running,
        KernelState::Terminating,
        KernelState::Terminated,
    ];

    #[test]
    fn happy_path_is_legal() {
        let mut state = LAUNCH_PATH[0];
        for next in &LAUNCH_PATH[1..] {
            state = state.advance(*next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn launch_path_cannot_go_backwards() {
        for pair in LAUNCH_PATH.windows(2) {
            assert!(
                !pair[1].can_transition_to(pair[0]),
                "{} -> {} should be illegal",
                pair[1],
                pair[0]
            );
        }
    }

    #[test]
    fn any_live_state_can_fail_or_terminate() {
        for state in LAUNCH_PATH.iter().filter(|state| !state.is_terminal()) {
            assert!(state.can_transition_to(KernelState::Failed));
            assert!(state.can_transition_to(KernelState::Terminating));
        }
    }

    #[test]
    fn terminal_states_are_frozen() {
        for terminal in [KernelState::Terminated, KernelState::Failed] {
            for next in LAUNCH_PATH {
                assert!(!terminal.can_transition_to(*next));
            }
            assert!(!terminal.can_transition_to(KernelState::Failed));
        }
    }

    #[test]
    fn launch_stages_cannot_skip_ahead() {
        assert!(!KernelState::Pending.can_transition_to(KernelState::Launching));
        assert!(!KernelState::Launching.can_transition_to(KernelState::Running));
        assert!(!KernelState::AwaitingConnection.can_transition_to(KernelState::Running));
        let err = KernelState::Pending.advance(KernelState::Running).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }
}
