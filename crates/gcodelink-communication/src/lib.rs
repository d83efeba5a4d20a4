//! # GCodeLink Communication
//!
//! Device side of GCodeLink: the Grbl protocol codec with its buffer
//! accounting, serial and in-memory device channels, and the program
//! executor actor that ties them together.

pub mod communication;
pub mod executor;
pub mod firmware;

pub use communication::{
    ChannelOpener, LineAssembler, SerialChannel, SerialPortChannel, SerialPortOpener,
    VirtualDevice, VirtualOpener,
};
pub use executor::{ExecSnapshot, ExecState, ExecutorHandle, ProgramExecutor};
pub use firmware::{create_device, DeviceProtocol, DeviceResponse, GrblDevice, RealtimeCommand};

use std::sync::Arc;

use gcodelink_core::{AppConfig, Result};

/// Spawn an executor for the configured device kind
pub fn spawn_executor(config: AppConfig, opener: Arc<dyn ChannelOpener>) -> Result<ProgramExecutor> {
    let device = create_device(&config.device);
    ProgramExecutor::spawn(config, device, opener)
}
