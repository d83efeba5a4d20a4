//! Executor behaviour against the in-memory Grbl device

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gcodelink_communication::{spawn_executor, ExecState, ProgramExecutor, VirtualDevice};
use gcodelink_core::{
    mailbox, ActorId, AppConfig, CommandSurface, Event, EventKind, Mailbox, Payload,
    PortSettings, Program, RunRequest, StreamMode,
};

const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    executor: ProgramExecutor,
    device: VirtualDevice,
    inbox: Mailbox,
}

fn port() -> PortSettings {
    PortSettings {
        port: "virtual".to_string(),
        baud_rate: 115200,
    }
}

fn start(config: AppConfig, device: VirtualDevice, open: bool) -> Harness {
    let executor = spawn_executor(config, Arc::new(device.opener())).expect("spawn executor");
    let (tx, inbox) = mailbox(ActorId::new());
    executor.add_listener(tx.owner(), Arc::new(tx));
    let harness = Harness {
        executor,
        device,
        inbox,
    };
    if open {
        harness.executor.open(Some(port()));
        harness.collect_until(EventKind::PortOpen);
    }
    harness
}

fn harness() -> Harness {
    start(AppConfig::default(), VirtualDevice::new(), true)
}

impl Harness {
    /// Every event up to and including the first of `kind`
    fn collect_until(&self, kind: EventKind) -> Vec<Event> {
        self.collect_until_match(|event| event.kind == kind)
    }

    fn collect_until_match(&self, done: impl Fn(&Event) -> bool) -> Vec<Event> {
        let deadline = Instant::now() + WAIT;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(!remaining.is_zero(), "timed out; saw {:?}", kinds(&events));
            if let Some(event) = self.inbox.recv_timeout(remaining).expect("listener open") {
                let finished = done(&event);
                events.push(event);
                if finished {
                    return events;
                }
            }
        }
    }

    fn assert_quiet(&self, period: Duration) {
        if let Some(event) = self.inbox.recv_timeout(period).expect("listener open") {
            panic!("unexpected {}", event.description());
        }
    }

    fn wait_for(&self, what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

fn pc_updates(events: &[Event]) -> Vec<usize> {
    events
        .iter()
        .filter(|event| event.kind == EventKind::PcUpdate)
        .filter_map(|event| event.payload.as_pc())
        .collect()
}

fn sequencing(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .filter(|event| {
            matches!(
                event.kind,
                EventKind::PcUpdate
                    | EventKind::RunEnd
                    | EventKind::StepEnd
                    | EventKind::BreakpointHit
                    | EventKind::GcodeMessage
            )
        })
        .cloned()
        .collect()
}

fn two_liner() -> Program {
    Program::new("job.nc", vec!["G00 X1\n".to_string(), "G00 X2\n".to_string()])
}

fn numbered(lines: usize) -> Program {
    Program::new(
        "numbered.nc",
        (0..lines).map(|i| format!("G01 X{}\n", i)).collect(),
    )
}

fn run_request(program: Program, breakpoints: impl IntoIterator<Item = usize>) -> RunRequest {
    let mut request = RunRequest::with_program(program, Some(0));
    request.breakpoints = breakpoints.into_iter().collect();
    request
}

fn resume_request(program: &Program, breakpoints: impl IntoIterator<Item = usize>) -> RunRequest {
    RunRequest {
        fingerprint: program.fingerprint.clone(),
        program: None,
        pc: None,
        breakpoints: breakpoints.into_iter().collect(),
    }
}

#[test]
fn runs_program_to_completion() {
    let h = harness();
    h.executor.run(run_request(two_liner(), []));

    let events = h.collect_until(EventKind::RunEnd);
    let sender = h.executor.id();
    assert_eq!(
        sequencing(&events),
        vec![
            Event::new(EventKind::PcUpdate, Payload::Pc(0), sender),
            Event::new(EventKind::PcUpdate, Payload::Pc(1), sender),
            Event::bare(EventKind::RunEnd, sender),
        ]
    );
    assert_eq!(h.executor.state(), ExecState::Idle);
    assert_eq!(h.device.written_lines(), vec!["G00 X1", "G00 X2"]);
}

#[test]
fn breakpoint_holds_program_counter() {
    let h = harness();
    h.executor.run(run_request(two_liner(), [1]));

    let events = h.collect_until(EventKind::BreakpointHit);
    assert_eq!(pc_updates(&events), vec![0, 1]);
    assert_eq!(events.last().map(|e| e.payload.clone()), Some(Payload::Pc(1)));
    assert_eq!(h.executor.state(), ExecState::Break);
    assert_eq!(h.executor.pc(), 1);

    h.assert_quiet(Duration::from_millis(100));
    assert_eq!(h.executor.pc(), 1);
    assert_eq!(h.device.written_lines(), vec!["G00 X1"]);
}

#[test]
fn breakpoint_reports_every_pc_once_and_resumes_past_it() {
    let h = harness();
    let program = numbered(6);
    h.executor.run(run_request(program.clone(), [4]));

    let events = h.collect_until(EventKind::BreakpointHit);
    assert_eq!(pc_updates(&events), vec![0, 1, 2, 3, 4]);
    assert_eq!(
        events.iter().filter(|e| e.kind == EventKind::BreakpointHit).count(),
        1
    );
    assert_eq!(h.executor.state(), ExecState::Break);

    h.executor.run(resume_request(&program, [4]));
    let events = h.collect_until(EventKind::RunEnd);
    assert_eq!(pc_updates(&events), vec![5]);
    assert!(!kinds(&events).contains(&EventKind::BreakpointHit));
    assert_eq!(h.device.written_lines().len(), 6);
}

#[test]
fn stop_then_resume_continues_from_last_reported_pc() {
    let device = VirtualDevice::new();
    device.set_auto_ack(false);
    let h = start(AppConfig::default(), device, true);
    let program = numbered(5);
    h.executor.run(run_request(program.clone(), []));

    h.collect_until(EventKind::PcUpdate);
    h.wait_for("first line", || h.device.written_lines().len() == 1);
    assert!(h.device.release_ack());
    let events = h.collect_until(EventKind::PcUpdate);
    assert_eq!(pc_updates(&events), vec![1]);

    h.executor.stop();
    h.wait_for("stop", || h.executor.state() == ExecState::Idle);
    assert_eq!(h.executor.pc(), 1);

    h.device.set_auto_ack(true);
    h.executor.run(resume_request(&program, []));
    let events = h.collect_until(EventKind::RunEnd);
    assert_eq!(pc_updates(&events), vec![2, 3, 4]);
    let written = h.device.written_lines();
    assert_eq!(written.last().map(String::as_str), Some("G01 X4"));
    assert!(written.contains(&"G01 X1".to_string()));
}

#[test]
fn stop_while_idle_is_silent() {
    let h = harness();
    h.executor.stop();
    h.assert_quiet(Duration::from_millis(100));
    assert_eq!(h.executor.state(), ExecState::Idle);
}

#[test]
fn step_executes_one_line() {
    let h = harness();
    h.executor.step(run_request(numbered(3), []));

    let events = h.collect_until(EventKind::StepEnd);
    assert_eq!(pc_updates(&events), vec![0, 1]);
    assert_eq!(h.executor.state(), ExecState::Idle);
    assert_eq!(h.executor.pc(), 1);
    assert_eq!(h.device.written_lines(), vec!["G01 X0"]);
}

#[test]
fn device_error_breaks_run() {
    let device = VirtualDevice::new();
    device.fail_on("G5", 20);
    let h = start(AppConfig::default(), device, true);
    let program = Program::new(
        "faulty.nc",
        vec!["G0 X1\n".into(), "G5\n".into(), "G0 X2\n".into()],
    );
    h.executor.run(run_request(program.clone(), []));

    let events = h.collect_until(EventKind::DeviceError);
    match &events.last().map(|e| e.payload.clone()) {
        Some(Payload::Fault(fault)) => assert_eq!(fault.code, Some(20)),
        other => panic!("unexpected payload {:?}", other),
    }
    h.collect_until_match(|e| e.kind == EventKind::PcUpdate && e.payload.as_pc() == Some(2));
    assert_eq!(h.executor.state(), ExecState::Break);
    assert_eq!(h.executor.pc(), 2);

    h.executor.run(resume_request(&program, []));
    h.collect_until(EventKind::RunEnd);
    assert_eq!(h.device.written_lines(), vec!["G0 X1", "G5", "G0 X2"]);
}

#[test]
fn message_directive_pauses_until_resumed() {
    let h = harness();
    let program = Program::new(
        "tool-change.nc",
        vec![
            "G0 X1\n".into(),
            "(MSG, Change tool)\n".into(),
            "G0 X2 ; finish\n".into(),
        ],
    );
    h.executor.run(run_request(program.clone(), []));

    let events = h.collect_until(EventKind::GcodeMessage);
    assert_eq!(
        events.last().and_then(|e| e.payload.as_text()),
        Some("Change tool")
    );
    assert_eq!(h.executor.state(), ExecState::Pause);
    assert_eq!(h.executor.pc(), 1);

    h.executor.run(resume_request(&program, []));
    h.collect_until(EventKind::RunEnd);
    assert_eq!(h.device.written_lines(), vec!["G0 X1", "G0 X2"]);
}

#[test]
fn pause_holds_a_running_program() {
    let device = VirtualDevice::new();
    device.set_auto_ack(false);
    let h = start(AppConfig::default(), device, true);
    let program = numbered(4);
    h.executor.run(run_request(program.clone(), []));
    h.wait_for("first line", || h.device.written_lines().len() == 1);

    h.executor.pause();
    h.wait_for("pause", || h.executor.state() == ExecState::Pause);
    h.device.set_auto_ack(true);
    h.assert_quiet_of(EventKind::DataOut, Duration::from_millis(100));
    assert_eq!(h.device.written_lines().len(), 1);

    h.executor.run(resume_request(&program, []));
    h.collect_until(EventKind::RunEnd);
    assert_eq!(h.device.written_lines().len(), 4);
}

impl Harness {
    fn assert_quiet_of(&self, kind: EventKind, period: Duration) {
        let deadline = Instant::now() + period;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            if let Some(event) = self.inbox.recv_timeout(remaining).expect("listener open") {
                assert_ne!(event.kind, kind, "unexpected {}", event.description());
            }
        }
    }
}

#[test]
fn character_counting_streams_ahead_of_acks() {
    let mut config = AppConfig::default();
    config.executor.stream_mode = StreamMode::CharacterCounting;
    let device = VirtualDevice::new();
    device.set_auto_ack(false);
    let h = start(config, device, true);

    h.executor.run(run_request(numbered(3), []));
    h.wait_for("all lines written", || h.device.written_lines().len() == 3);
    h.assert_quiet_of(EventKind::RunEnd, Duration::from_millis(50));
    assert_eq!(h.executor.state(), ExecState::Run);

    assert_eq!(h.device.release_all(), 3);
    h.collect_until(EventKind::RunEnd);
    assert_eq!(h.executor.state(), ExecState::Idle);
}

#[test]
fn character_counting_respects_watermark() {
    let mut config = AppConfig::default();
    config.executor.stream_mode = StreamMode::CharacterCounting;
    let device = VirtualDevice::new();
    device.set_auto_ack(false);
    let h = start(config, device, true);

    // 30 bytes per line on the wire: three fit under 114, a fourth does not
    let line = format!("G01 X{}\n", "1".repeat(24));
    let program = Program::new("wide.nc", vec![line; 6]);
    h.executor.run(run_request(program, []));

    h.wait_for("buffer filled", || h.device.written_lines().len() == 3);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.device.written_lines().len(), 3);

    assert!(h.device.release_ack());
    h.wait_for("one more line", || h.device.written_lines().len() == 4);
    h.device.set_auto_ack(true);
    h.collect_until(EventKind::RunEnd);
    assert_eq!(h.device.written_lines().len(), 6);
}

#[test]
fn channel_failure_aborts() {
    let h = harness();
    h.device.set_fail_write(true);
    h.executor.run(run_request(two_liner(), []));

    let events = h.collect_until(EventKind::Abort);
    let diagnostic = events.last().and_then(|e| e.payload.as_text()).unwrap_or("");
    assert!(diagnostic.contains("Write failed"), "{}", diagnostic);
    h.wait_for("thread exit", || h.executor.is_finished());
    assert_eq!(h.executor.state(), ExecState::Abort);
}

#[test]
fn open_failure_aborts() {
    let device = VirtualDevice::new();
    device.set_fail_open(true);
    let h = start(AppConfig::default(), device, false);
    h.executor.open(Some(port()));
    h.collect_until(EventKind::Abort);
    h.wait_for("thread exit", || h.executor.is_finished());
}

#[test]
fn run_without_channel_is_ignored() {
    let h = start(AppConfig::default(), VirtualDevice::new(), false);
    h.executor.run(run_request(two_liner(), []));
    h.assert_quiet(Duration::from_millis(100));
    assert_eq!(h.executor.state(), ExecState::Idle);
}

#[test]
fn raw_send_blocks_program_until_answered() {
    let device = VirtualDevice::new();
    device.set_auto_ack(false);
    let h = start(AppConfig::default(), device, true);

    h.executor.send("$X", true);
    let events = h.collect_until(EventKind::DataOut);
    assert_eq!(events.last().and_then(|e| e.payload.as_text()), Some("$X"));

    h.executor.run(run_request(two_liner(), []));
    h.wait_for("run", || h.executor.state() == ExecState::Run);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.device.written_lines(), vec!["$X"]);

    h.device.set_auto_ack(true);
    h.collect_until(EventKind::RunEnd);
    assert_eq!(h.device.written_lines(), vec!["$X", "G00 X1", "G00 X2"]);
}

#[test]
fn machine_commands_reach_the_device() {
    let h = harness();
    h.executor.set_axis(gcodelink_core::AxisCoords::xyz(0.0, 0.0, 0.0));
    h.executor.home(gcodelink_core::AxisCoords::new());
    h.executor.clear_alarm();
    h.executor.feed_hold();
    h.executor.cycle_start();
    h.wait_for("commands", || h.device.written_lines().len() == 3);
    assert_eq!(h.device.written_lines(), vec!["G92 X0 Y0 Z0", "$H", "$X"]);
    h.wait_for("realtime", || h.device.realtime_bytes().len() == 2);
    assert_eq!(h.device.realtime_bytes(), vec![b'!', b'~']);
}

#[test]
fn status_query_produces_status_only() {
    let h = harness();
    h.device.set_status_line("<Run|MPos:1.000,2.000,3.000|FS:500,0>");
    h.executor.get_status();
    let events = h.collect_until(EventKind::DataStatus);
    assert_eq!(kinds(&events), vec![EventKind::DataStatus]);
    match &events[0].payload {
        Payload::Status(status) => {
            assert_eq!(status.state, "Run");
            assert_eq!(status.feed_rate, Some(500.0));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn banner_and_alarm_are_classified() {
    let device = VirtualDevice::new();
    device.set_banner("Grbl 1.1h ['$' for help]");
    let h = start(AppConfig::default(), device, true);

    let events = h.collect_until(EventKind::DeviceDetected);
    assert_eq!(events.last().and_then(|e| e.payload.as_text()), Some("1.1h"));

    h.device.push_line("ALARM:1");
    let events = h.collect_until(EventKind::Alarm);
    match &events.last().map(|e| e.payload.clone()) {
        Some(Payload::Fault(fault)) => {
            assert_eq!(fault.code, Some(1));
            assert!(fault.description.contains("Hard limit"));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn reports_program_breakpoints_and_config() {
    let h = harness();
    let program = numbered(3);
    h.executor.run(run_request(program.clone(), [2, 9]));
    h.collect_until(EventKind::BreakpointHit);

    h.executor.get_gcode();
    let events = h.collect_until(EventKind::Gcode);
    assert_eq!(
        events.last().map(|e| e.payload.clone()),
        Some(Payload::Program(program))
    );

    h.executor.get_breakpoints();
    let events = h.collect_until(EventKind::Breakpoints);
    assert_eq!(
        events.last().map(|e| e.payload.clone()),
        Some(Payload::Breakpoints(BTreeSet::from([2])))
    );

    h.executor.get_config();
    let events = h.collect_until(EventKind::Config);
    match &events.last().map(|e| e.payload.clone()) {
        Some(Payload::ConfigReport { ports, .. }) => assert_eq!(ports, &vec!["virtual".to_string()]),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn close_and_exit_release_the_channel() {
    let h = harness();
    h.executor.close();
    h.collect_until(EventKind::PortClose);
    assert!(!h.executor.port_open());

    let Harness { executor, .. } = h;
    executor.shutdown();
}

#[test]
fn jump_discards_acks_owed_for_the_old_position() {
    let device = VirtualDevice::new();
    device.set_auto_ack(false);
    let h = start(AppConfig::default(), device, true);
    let program = numbered(5);
    h.executor.run(run_request(program.clone(), []));
    h.wait_for("first line", || h.device.written_lines().len() == 1);

    h.executor.pause();
    h.wait_for("pause", || h.executor.state() == ExecState::Pause);

    let mut jump = resume_request(&program, []);
    jump.pc = Some(0);
    h.executor.run(jump);
    h.wait_for("line 0 resent", || h.device.written_lines().len() == 2);

    // the old ack retires bytes but leaves the PC alone
    assert!(h.device.release_ack());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.executor.pc(), 0);
    assert_eq!(h.device.written_lines().len(), 2);

    assert!(h.device.release_ack());
    h.wait_for("line 1", || h.device.written_lines().len() == 3);
    assert_eq!(h.executor.pc(), 1);

    h.device.set_auto_ack(true);
    h.collect_until(EventKind::RunEnd);
    assert_eq!(
        h.device.written_lines(),
        vec!["G01 X0", "G01 X0", "G01 X1", "G01 X2", "G01 X3", "G01 X4"]
    );
}

#[test]
fn loading_a_program_announces_its_fingerprint() {
    let h = harness();
    let program = two_liner();
    h.executor.run(run_request(program.clone(), []));

    let loaded = h.collect_until(EventKind::ProgramLoaded);
    assert_eq!(
        loaded.last().and_then(|e| e.payload.as_text()),
        Some(program.fingerprint.as_str())
    );
    h.collect_until(EventKind::RunEnd);

    h.executor.run(run_request(program, []));
    let events = h.collect_until(EventKind::RunEnd);
    assert!(!kinds(&events).contains(&EventKind::ProgramLoaded));
}

#[test]
fn unknown_fingerprint_is_reported() {
    let h = harness();
    let program = two_liner();
    h.executor.run(resume_request(&program, []));

    let events = h.collect_until(EventKind::ProgramUnknown);
    assert_eq!(
        events.last().and_then(|e| e.payload.as_text()),
        Some(program.fingerprint.as_str())
    );
    assert_eq!(h.executor.state(), ExecState::Idle);
    assert!(h.device.written_lines().is_empty());
}
