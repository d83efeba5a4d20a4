//! Executor state machine states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution state of the program executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecState {
    /// Nothing is executing
    #[default]
    Idle,
    /// Streaming the program continuously
    Run,
    /// Executing a single line
    Step,
    /// Stopped at a breakpoint or after a device error
    Break,
    /// Channel failure or exit, the loop is gone
    Abort,
    /// Paused by a command or an embedded message
    Pause,
}

impl ExecState {
    /// True while program lines are being sequenced
    pub fn is_executing(&self) -> bool {
        matches!(self, ExecState::Run | ExecState::Step)
    }

    /// States a RUN command is accepted from
    pub fn accepts_run(&self) -> bool {
        matches!(self, ExecState::Idle | ExecState::Break | ExecState::Pause)
    }

    /// States a STEP command is accepted from
    pub fn accepts_step(&self) -> bool {
        matches!(self, ExecState::Idle | ExecState::Break)
    }

    /// States a STOP command has an effect in
    pub fn accepts_stop(&self) -> bool {
        matches!(
            self,
            ExecState::Run | ExecState::Step | ExecState::Break | ExecState::Pause
        )
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecState::Idle => "IDLE",
            ExecState::Run => "RUN",
            ExecState::Step => "STEP",
            ExecState::Break => "BREAK",
            ExecState::Abort => "ABORT",
            ExecState::Pause => "PAUSE",
        };
        f.write_str(name)
    }
}

/// Snapshot of executor progress, readable from any thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecSnapshot {
    /// Current state
    pub state: ExecState,
    /// Current program counter
    pub pc: usize,
    /// True while a device channel is open
    pub port_open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(ExecState::Idle.accepts_run());
        assert!(ExecState::Break.accepts_run());
        assert!(ExecState::Pause.accepts_run());
        assert!(!ExecState::Run.accepts_run());
        assert!(!ExecState::Step.accepts_run());

        assert!(ExecState::Idle.accepts_step());
        assert!(ExecState::Break.accepts_step());
        assert!(!ExecState::Pause.accepts_step());

        assert!(!ExecState::Idle.accepts_stop());
        assert!(!ExecState::Abort.accepts_stop());
        assert!(ExecState::Pause.accepts_stop());
    }

    #[test]
    fn test_display() {
        assert_eq!(ExecState::Break.to_string(), "BREAK");
        assert_eq!(ExecState::default(), ExecState::Idle);
    }
}
