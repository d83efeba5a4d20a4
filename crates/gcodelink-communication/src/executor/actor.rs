//! Program executor actor
//!
//! The executor owns the device channel, the device protocol state and the
//! loaded program. It runs on its own thread and alternates between three
//! things each iteration: draining its mailbox, reading and classifying
//! device output, and advancing the program by at most one line.
//!
//! The mailbox wait doubles as the poll interval. After an iteration that
//! made progress the next wait is zero, so a program streams as fast as the
//! device acknowledges it.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gcodelink_core::{
    ActorId, AppConfig, ChannelError, Event, EventKind, ListenerRegistry, Mailbox, Payload,
    PortSettings, Program, RunRequest, StreamMode,
};
use parking_lot::RwLock;

use super::line::{message_directive, strip_comments};
use super::state::{ExecSnapshot, ExecState};
use crate::communication::{ChannelOpener, LineAssembler, SerialChannel};
use crate::firmware::{DeviceProtocol, DeviceResponse, RealtimeCommand};

/// What an outstanding device acknowledgement belongs to
///
/// Kept in step with the device's in-flight FIFO: one entry per line
/// written with bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckTarget {
    /// A program line
    ProgramLine,
    /// A raw line; `want_ack` holds the program until it is answered
    Raw { want_ack: bool },
    /// Wait abandoned by STOP; the reply is consumed and ignored
    Abandoned,
}

/// Raw line waiting to be written
#[derive(Debug, Clone)]
struct RawWrite {
    text: String,
    want_ack: bool,
}

/// The executor actor
pub struct Executor {
    id: ActorId,
    mailbox: Mailbox,
    listeners: ListenerRegistry,
    snapshot: Arc<RwLock<ExecSnapshot>>,
    config: AppConfig,
    device: Box<dyn DeviceProtocol>,
    opener: Arc<dyn ChannelOpener>,
    channel: Option<Box<dyn SerialChannel>>,
    assembler: LineAssembler,

    state: ExecState,
    program: Program,
    breakpoints: BTreeSet<usize>,
    pc: usize,
    run_start_pc: usize,
    last_notified_pc: Option<usize>,

    pending_acks: VecDeque<AckTarget>,
    write_queue: VecDeque<RawWrite>,
    last_status_poll: Instant,
    exit_requested: bool,
}

impl Executor {
    pub(super) fn new(
        mailbox: Mailbox,
        listeners: ListenerRegistry,
        snapshot: Arc<RwLock<ExecSnapshot>>,
        config: AppConfig,
        device: Box<dyn DeviceProtocol>,
        opener: Arc<dyn ChannelOpener>,
    ) -> Self {
        Self {
            id: mailbox.owner(),
            mailbox,
            listeners,
            snapshot,
            config,
            device,
            opener,
            channel: None,
            assembler: LineAssembler::new(),
            state: ExecState::Idle,
            program: Program::default(),
            breakpoints: BTreeSet::new(),
            pc: 0,
            run_start_pc: 0,
            last_notified_pc: None,
            pending_acks: VecDeque::new(),
            write_queue: VecDeque::new(),
            last_status_poll: Instant::now(),
            exit_requested: false,
        }
    }

    /// Run until EXIT, a channel failure, or every handle is dropped
    pub fn run_loop(mut self) {
        tracing::info!("Executor {} started ({})", self.id, self.device.device_name());
        let mut wait = Duration::ZERO;

        loop {
            match self.mailbox.recv_timeout(wait) {
                Ok(Some(event)) => {
                    self.handle_event(event);
                    while let Ok(Some(event)) = self.mailbox.try_recv() {
                        self.handle_event(event);
                    }
                }
                Ok(None) => {}
                Err(_) => {
                    tracing::debug!("Executor {} mailbox closed", self.id);
                    self.exit_requested = true;
                }
            }

            if self.exit_requested {
                break;
            }

            match self.iterate() {
                Ok(progressed) => {
                    wait = if progressed {
                        Duration::ZERO
                    } else {
                        self.config.executor.poll_interval()
                    };
                }
                Err(e) => {
                    self.abort(e);
                    return;
                }
            }
        }

        if self.channel.take().is_some() {
            self.notify(EventKind::PortClose, Payload::None);
        }
        self.set_state(ExecState::Abort);
        tracing::info!("Executor {} exited", self.id);
    }

    fn iterate(&mut self) -> Result<bool, ChannelError> {
        if self.channel.is_none() {
            return Ok(false);
        }
        let received = self.service_channel()?;
        self.poll_status()?;
        let flushed = self.flush_write_queue()?;
        let advanced = self.tick()?;
        Ok(received || flushed || advanced)
    }

    // ---- notifications -------------------------------------------------

    fn notify(&self, kind: EventKind, payload: Payload) {
        self.publish();
        self.listeners.notify_listeners(self.id, kind, payload);
    }

    fn publish(&self) {
        *self.snapshot.write() = ExecSnapshot {
            state: self.state,
            pc: self.pc,
            port_open: self.channel.is_some(),
        };
    }

    fn set_state(&mut self, state: ExecState) {
        if self.state != state {
            tracing::debug!("Executor state {} -> {}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn notify_pc(&mut self) {
        if self.last_notified_pc != Some(self.pc) && self.pc < self.program.len() {
            self.last_notified_pc = Some(self.pc);
            self.notify(EventKind::PcUpdate, Payload::Pc(self.pc));
        }
    }

    fn abort(&mut self, error: ChannelError) {
        tracing::error!("Executor {} aborting: {}", self.id, error);
        self.channel = None;
        self.pending_acks.clear();
        self.write_queue.clear();
        self.state = ExecState::Abort;
        self.notify(EventKind::Abort, Payload::Text(error.to_string()));
    }

    // ---- command handling ----------------------------------------------

    fn handle_event(&mut self, event: Event) {
        tracing::trace!("Executor received {}", event.description());
        if !event.kind.is_command() {
            tracing::warn!("Executor ignoring notification {}", event.kind);
            return;
        }

        let result = match (event.kind, event.payload) {
            (EventKind::Run, Payload::Run(request)) => {
                self.handle_run(request, ExecState::Run);
                Ok(())
            }
            (EventKind::Step, Payload::Run(request)) => {
                self.handle_run(request, ExecState::Step);
                Ok(())
            }
            (EventKind::Stop, _) => {
                self.handle_stop();
                Ok(())
            }
            (EventKind::Pause, _) => {
                if self.state == ExecState::Run {
                    self.set_state(ExecState::Pause);
                } else {
                    tracing::debug!("PAUSE ignored in {}", self.state);
                }
                Ok(())
            }
            (EventKind::Send, Payload::Text(text)) => {
                self.queue_raw(text, false);
                Ok(())
            }
            (EventKind::SendWithAck, Payload::Text(text)) => {
                self.queue_raw(text, true);
                Ok(())
            }
            (EventKind::GetStatus, _) => self.write_status_query(),
            (EventKind::SetAxis, Payload::Axes(axes)) => {
                let command = self.device.get_set_axis_cmd(&axes);
                self.queue_raw(command, false);
                Ok(())
            }
            (EventKind::Home, payload) => {
                let axes = match payload {
                    Payload::Axes(axes) => axes,
                    _ => Default::default(),
                };
                for command in self.device.get_home_cmds(&axes) {
                    self.queue_raw(command, false);
                }
                Ok(())
            }
            (
                kind @ (EventKind::JogMove
                | EventKind::JogMoveRelative
                | EventKind::JogRapidMove
                | EventKind::JogRapidMoveRelative),
                Payload::Jog(jog),
            ) => {
                let relative = matches!(
                    kind,
                    EventKind::JogMoveRelative | EventKind::JogRapidMoveRelative
                );
                let rapid = matches!(
                    kind,
                    EventKind::JogRapidMove | EventKind::JogRapidMoveRelative
                );
                for command in self.device.get_jog_cmds(&jog, relative, rapid) {
                    self.queue_raw(command, false);
                }
                Ok(())
            }
            (EventKind::CycleStart, _) => self.write_realtime(RealtimeCommand::CycleStart),
            (EventKind::FeedHold, _) => self.write_realtime(RealtimeCommand::FeedHold),
            (EventKind::Reset, _) => self.reset_device(false),
            (EventKind::QueueFlush, _) => self.reset_device(true),
            (EventKind::ClearAlarm, _) => {
                let command = self.device.get_clear_alarm_cmd();
                self.queue_raw(command, false);
                Ok(())
            }
            (EventKind::Open, payload) => self.handle_open(payload),
            (EventKind::Close, _) => {
                self.handle_close();
                Ok(())
            }
            (EventKind::Exit, _) => {
                self.exit_requested = true;
                Ok(())
            }
            (EventKind::GetConfig, _) => {
                let ports = self.opener.list_ports();
                self.notify(
                    EventKind::Config,
                    Payload::ConfigReport {
                        config: Box::new(self.config.clone()),
                        ports,
                    },
                );
                Ok(())
            }
            (EventKind::UpdateConfig, Payload::Config(config)) => {
                self.handle_update_config(*config);
                Ok(())
            }
            (EventKind::GetGcode, _) => {
                self.notify(EventKind::Gcode, Payload::Program(self.program.clone()));
                Ok(())
            }
            (EventKind::GetBreakpoints, _) => {
                self.notify(
                    EventKind::Breakpoints,
                    Payload::Breakpoints(self.breakpoints.clone()),
                );
                Ok(())
            }
            (kind, payload) => {
                tracing::warn!("Executor ignoring {} with payload {:?}", kind, payload);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.abort(e);
            self.exit_requested = true;
        }
    }

    fn handle_run(&mut self, request: RunRequest, target: ExecState) {
        let allowed = match target {
            ExecState::Step => self.state.accepts_step(),
            _ => self.state.accepts_run(),
        };
        if !allowed {
            tracing::debug!("{} ignored in {}", target, self.state);
            return;
        }
        if self.channel.is_none() {
            tracing::warn!("{} ignored: no device channel open", target);
            return;
        }

        let mut loaded = false;
        match request.program {
            Some(program) => {
                if program.fingerprint != self.program.fingerprint || self.program.is_empty() {
                    tracing::info!(
                        "Loaded program '{}' ({} lines)",
                        program.file_id,
                        program.len()
                    );
                    self.program = program;
                    self.pc = 0;
                    self.last_notified_pc = None;
                    loaded = true;
                }
            }
            None => {
                if !request.fingerprint.is_empty()
                    && request.fingerprint != self.program.fingerprint
                {
                    tracing::warn!(
                        "{} ignored: program {} is not loaded",
                        target,
                        request.fingerprint
                    );
                    self.notify(EventKind::ProgramUnknown, Payload::Text(request.fingerprint));
                    return;
                }
            }
        }

        // acks still owed for lines of the old position must not move the new PC
        if loaded || request.pc.is_some() {
            self.abandon_program_acks();
        }

        let len = self.program.len();
        self.breakpoints = request.breakpoints.into_iter().filter(|&bp| bp < len).collect();
        if let Some(pc) = request.pc {
            self.pc = pc.min(len);
            self.last_notified_pc = None;
        }
        if loaded {
            self.notify(
                EventKind::ProgramLoaded,
                Payload::Text(self.program.fingerprint.clone()),
            );
        }
        self.run_start_pc = self.pc;
        self.set_state(target);
    }

    fn handle_stop(&mut self) {
        if !self.state.accepts_stop() {
            return;
        }
        self.abandon_program_acks();
        for target in self.pending_acks.iter_mut() {
            if let AckTarget::Raw { want_ack } = target {
                *want_ack = false;
            }
        }
        self.set_state(ExecState::Idle);
        self.notify_pc();
    }

    fn abandon_program_acks(&mut self) {
        for target in self.pending_acks.iter_mut() {
            if *target == AckTarget::ProgramLine {
                *target = AckTarget::Abandoned;
            }
        }
    }

    fn handle_open(&mut self, payload: Payload) -> Result<(), ChannelError> {
        if let Some(channel) = &self.channel {
            tracing::debug!("OPEN ignored: {} already open", channel.name());
            let name = channel.name().to_string();
            self.notify(EventKind::PortOpen, Payload::Text(name));
            return Ok(());
        }

        let settings = match payload {
            Payload::Port(settings) => settings,
            _ => PortSettings {
                port: self.config.device.port.clone(),
                baud_rate: self.config.device.baud_rate,
            },
        };

        let channel = self.opener.open(&settings)?;
        tracing::info!("Device channel {} open", channel.name());
        self.channel = Some(channel);
        self.device.init_comm();
        self.assembler.clear();
        self.pending_acks.clear();
        self.write_queue.clear();
        self.last_status_poll = Instant::now();
        self.notify(EventKind::PortOpen, Payload::Text(settings.port));
        Ok(())
    }

    fn handle_close(&mut self) {
        let was_open = self.channel.take().is_some();
        self.pending_acks.clear();
        self.write_queue.clear();
        self.device.init_comm();
        self.set_state(ExecState::Idle);
        if was_open {
            tracing::info!("Device channel closed");
            self.notify(EventKind::PortClose, Payload::None);
        }
    }

    fn handle_update_config(&mut self, config: AppConfig) {
        if let Err(e) = config.validate() {
            tracing::warn!("UPDATE_CONFIG rejected: {}", e);
            return;
        }
        self.device.configure(&config.device);
        self.config = config;
        tracing::info!("Executor configuration updated");
    }

    fn queue_raw(&mut self, text: String, want_ack: bool) {
        if self.channel.is_none() {
            tracing::warn!("Dropping '{}': no device channel open", text.trim());
            return;
        }
        self.write_queue.push_back(RawWrite { text, want_ack });
    }

    // ---- device I/O ------------------------------------------------------

    fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        match self.channel.as_mut() {
            Some(channel) => channel.write(bytes),
            None => Err(ChannelError::NotOpen),
        }
    }

    fn write_status_query(&mut self) -> Result<(), ChannelError> {
        if self.channel.is_none() {
            tracing::warn!("GET_STATUS ignored: no device channel open");
            return Ok(());
        }
        let query = self.device.get_status();
        self.last_status_poll = Instant::now();
        self.write(&query)
    }

    fn write_realtime(&mut self, command: RealtimeCommand) -> Result<(), ChannelError> {
        if self.channel.is_none() {
            tracing::warn!("{:?} ignored: no device channel open", command);
            return Ok(());
        }
        let bytes = self.device.get_realtime_cmd(command);
        self.write(&bytes)
    }

    fn reset_device(&mut self, flush_queue: bool) -> Result<(), ChannelError> {
        if self.channel.is_none() {
            tracing::warn!("Reset ignored: no device channel open");
            return Ok(());
        }
        if flush_queue {
            self.write_queue.clear();
        }
        self.write_realtime(RealtimeCommand::Reset)?;
        self.device.init_comm();
        self.assembler.clear();
        self.pending_acks.clear();
        if self.state.accepts_stop() {
            self.set_state(ExecState::Idle);
            self.notify_pc();
        }
        Ok(())
    }

    fn poll_status(&mut self) -> Result<(), ChannelError> {
        if let Some(interval) = self.config.executor.status_poll_interval() {
            if self.last_status_poll.elapsed() >= interval {
                self.write_status_query()?;
            }
        }
        Ok(())
    }

    fn service_channel(&mut self) -> Result<bool, ChannelError> {
        let bytes = match self.channel.as_mut() {
            Some(channel) => channel.read_available()?,
            None => return Ok(false),
        };
        if bytes.is_empty() {
            return Ok(false);
        }
        for line in self.assembler.push(&bytes) {
            self.handle_response(line);
        }
        Ok(true)
    }

    fn handle_response(&mut self, line: String) {
        match self.device.decode(&line) {
            DeviceResponse::Status(status) => {
                self.notify(EventKind::DataStatus, Payload::Status(status));
            }
            DeviceResponse::Ack => {
                self.notify(EventKind::DataIn, Payload::Text(line));
                self.retire(false);
            }
            DeviceResponse::Error(fault) => {
                tracing::warn!("Device error: {} ({})", fault.message, fault.description);
                self.notify(EventKind::DataIn, Payload::Text(line));
                self.notify(EventKind::DeviceError, Payload::Fault(fault));
                self.retire(true);
            }
            DeviceResponse::Version(version) => {
                tracing::info!("Detected {} {}", self.device.device_name(), version);
                self.notify(EventKind::DataIn, Payload::Text(line));
                self.notify(EventKind::DeviceDetected, Payload::Text(version));
            }
            DeviceResponse::Alarm(fault) => {
                tracing::warn!("Device alarm: {} ({})", fault.message, fault.description);
                self.notify(EventKind::DataIn, Payload::Text(line));
                self.notify(EventKind::Alarm, Payload::Fault(fault));
            }
            DeviceResponse::Raw(text) => {
                self.notify(EventKind::DataIn, Payload::Text(text));
            }
        }
    }

    fn retire(&mut self, is_error: bool) {
        let Some(target) = self.pending_acks.pop_front() else {
            return;
        };
        if target != AckTarget::ProgramLine {
            return;
        }

        if self.config.executor.stream_mode == StreamMode::SendResponse {
            self.pc += 1;
        }

        if is_error {
            match self.state {
                ExecState::Run => {
                    self.set_state(ExecState::Break);
                    self.notify_pc();
                }
                ExecState::Step => {
                    self.set_state(ExecState::Idle);
                    self.notify_pc();
                }
                _ => {}
            }
        } else if self.state == ExecState::Step
            && self.config.executor.stream_mode == StreamMode::SendResponse
        {
            self.finish_step();
        }
    }

    fn finish_step(&mut self) {
        self.notify_pc();
        self.set_state(ExecState::Idle);
        self.notify(EventKind::StepEnd, Payload::None);
    }

    // ---- sequencing ------------------------------------------------------

    fn raw_ack_outstanding(&self) -> bool {
        self.pending_acks
            .iter()
            .any(|target| matches!(target, AckTarget::Raw { want_ack: true }))
    }

    fn program_ack_outstanding(&self) -> bool {
        self.pending_acks.contains(&AckTarget::ProgramLine)
    }

    /// True if `line` may be written now
    ///
    /// A line that can never fit is written once nothing is in flight.
    fn has_headroom(&self, line: &str) -> bool {
        if self.device.ok_to_send(line) {
            return true;
        }
        if self.device.bytes_in_flight() == 0 {
            tracing::warn!(
                "Line exceeds the {} byte device buffer, sending anyway",
                self.device.buffer_capacity()
            );
            return true;
        }
        false
    }

    fn flush_write_queue(&mut self) -> Result<bool, ChannelError> {
        let mut progressed = false;
        while !self.raw_ack_outstanding() {
            let Some(next) = self.write_queue.front() else {
                break;
            };
            if !self.has_headroom(&next.text) {
                break;
            }
            let Some(raw) = self.write_queue.pop_front() else {
                break;
            };
            let bytes = self.device.encode(&raw.text, true);
            self.pending_acks.push_back(AckTarget::Raw {
                want_ack: raw.want_ack,
            });
            self.write(&bytes)?;
            self.notify(EventKind::DataOut, Payload::Text(raw.text));
            progressed = true;
        }
        Ok(progressed)
    }

    /// Advance the program by at most one line
    fn tick(&mut self) -> Result<bool, ChannelError> {
        if !self.state.is_executing() {
            return Ok(false);
        }
        if self.raw_ack_outstanding() {
            return Ok(false);
        }
        let counting = self.config.executor.stream_mode == StreamMode::CharacterCounting;
        if !counting && self.program_ack_outstanding() {
            return Ok(false);
        }

        if self.pc >= self.program.len() {
            if self.program_ack_outstanding() {
                return Ok(false);
            }
            let end = match self.state {
                ExecState::Step => EventKind::StepEnd,
                _ => EventKind::RunEnd,
            };
            self.set_state(ExecState::Idle);
            self.notify(end, Payload::None);
            return Ok(true);
        }

        self.notify_pc();

        let pc = self.pc;
        if self.state == ExecState::Run && pc != self.run_start_pc && self.breakpoints.contains(&pc)
        {
            self.set_state(ExecState::Break);
            self.notify(EventKind::BreakpointHit, Payload::Pc(pc));
            return Ok(true);
        }

        let raw_line = self.program.line(pc).unwrap_or_default().to_string();
        if pc != self.run_start_pc {
            if let Some(message) = message_directive(&raw_line) {
                self.set_state(ExecState::Pause);
                self.notify(EventKind::GcodeMessage, Payload::Text(message));
                return Ok(true);
            }
        }

        let line = strip_comments(&raw_line);
        if line.is_empty() {
            self.pc += 1;
            return Ok(true);
        }

        if !self.has_headroom(&line) {
            return Ok(false);
        }

        let bytes = self.device.encode(&line, true);
        self.pending_acks.push_back(AckTarget::ProgramLine);
        self.write(&bytes)?;
        self.notify(EventKind::DataOut, Payload::Text(line));

        if counting {
            self.pc += 1;
            if self.state == ExecState::Step {
                self.finish_step();
            }
        }
        Ok(true)
    }
}
