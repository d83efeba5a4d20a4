//! Program executor
//!
//! A state machine that streams a loaded [`Program`](gcodelink_core::Program)
//! to a device with flow control, honours breakpoints and single steps, and
//! turns device replies into notifications.
//!
//! | State | RUN | STOP | STEP | breakpoint | device error | program end |
//! |-------|-----|------|------|------------|--------------|-------------|
//! | IDLE  | RUN | -    | STEP |            |              |             |
//! | RUN   | -   | IDLE | -    | BREAK      | BREAK        | IDLE + RUN_END |
//! | STEP  | -   | IDLE | -    |            | IDLE         | IDLE + STEP_END |
//! | BREAK | RUN | IDLE | STEP | -          |              |             |
//! | PAUSE | RUN | IDLE | -    |            |              |             |
//!
//! EXIT moves any state to ABORT and ends the loop.

mod actor;
mod handle;
pub mod line;
mod state;

pub use handle::{ExecutorHandle, ProgramExecutor};
pub use state::{ExecSnapshot, ExecState};
