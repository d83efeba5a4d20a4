//! Command surface
//!
//! A [`CommandSurface`] is anything a front end can drive an executor
//! through: the in-process executor handle or a remote client connected
//! over the wire. Both expose the same operations and the same listener
//! registration, so callers do not care which one they hold.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::data::{AxisCoords, JogRequest, PortSettings, RunRequest};
use crate::event_bus::{ActorId, Event, EventKind, EventSink, ListenerRegistry, Payload};

/// Operations accepted by an executor, local or remote
///
/// Every operation enqueues one command event stamped with [`caller`] and
/// returns immediately. The return value is false if the target is gone.
///
/// [`caller`]: CommandSurface::caller
pub trait CommandSurface {
    /// Deliver a command event to the target
    fn post(&self, event: Event) -> bool;

    /// Id stamped on outgoing commands
    fn caller(&self) -> ActorId;

    /// Registry notifications are fanned out to
    fn listeners(&self) -> &ListenerRegistry;

    /// Subscribe to notifications
    fn add_listener(&self, id: ActorId, sink: Arc<dyn EventSink>) {
        self.listeners().add_listener(id, sink);
    }

    /// Unsubscribe from notifications
    fn remove_listener(&self, id: ActorId) -> bool {
        self.listeners().remove_listener(id)
    }

    /// Send an arbitrary command
    fn command(&self, kind: EventKind, payload: Payload) -> bool {
        self.post(Event::new(kind, payload, self.caller()))
    }

    /// Start or resume continuous execution
    fn run(&self, request: RunRequest) -> bool {
        self.command(EventKind::Run, Payload::Run(request))
    }

    /// Execute a single line
    fn step(&self, request: RunRequest) -> bool {
        self.command(EventKind::Step, Payload::Run(request))
    }

    /// Stop execution, keeping the PC
    fn stop(&self) -> bool {
        self.command(EventKind::Stop, Payload::None)
    }

    /// Pause a running program
    fn pause(&self) -> bool {
        self.command(EventKind::Pause, Payload::None)
    }

    /// Write a raw line, optionally tracked for acknowledgement
    fn send(&self, text: impl Into<String>, want_ack: bool) -> bool
    where
        Self: Sized,
    {
        let kind = if want_ack {
            EventKind::SendWithAck
        } else {
            EventKind::Send
        };
        self.command(kind, Payload::Text(text.into()))
    }

    /// Request a status report
    fn get_status(&self) -> bool {
        self.command(EventKind::GetStatus, Payload::None)
    }

    /// Set work coordinates
    fn set_axis(&self, axes: AxisCoords) -> bool {
        self.command(EventKind::SetAxis, Payload::Axes(axes))
    }

    /// Run a homing cycle
    fn home(&self, axes: AxisCoords) -> bool {
        self.command(EventKind::Home, Payload::Axes(axes))
    }

    /// Jog the machine
    fn jog_move(&self, jog: JogRequest, relative: bool, rapid: bool) -> bool {
        let kind = match (relative, rapid) {
            (false, false) => EventKind::JogMove,
            (true, false) => EventKind::JogMoveRelative,
            (false, true) => EventKind::JogRapidMove,
            (true, true) => EventKind::JogRapidMoveRelative,
        };
        self.command(kind, Payload::Jog(jog))
    }

    /// Resume after a feed hold
    fn cycle_start(&self) -> bool {
        self.command(EventKind::CycleStart, Payload::None)
    }

    /// Hold motion
    fn feed_hold(&self) -> bool {
        self.command(EventKind::FeedHold, Payload::None)
    }

    /// Discard everything queued on the device side
    fn queue_flush(&self) -> bool {
        self.command(EventKind::QueueFlush, Payload::None)
    }

    /// Soft reset the device
    fn reset(&self) -> bool {
        self.command(EventKind::Reset, Payload::None)
    }

    /// Clear an alarm lock
    fn clear_alarm(&self) -> bool {
        self.command(EventKind::ClearAlarm, Payload::None)
    }

    /// Open the device channel, using configured settings if `None`
    fn open(&self, port: Option<PortSettings>) -> bool {
        let payload = port.map(Payload::Port).unwrap_or_default();
        self.command(EventKind::Open, payload)
    }

    /// Close the device channel
    fn close(&self) -> bool {
        self.command(EventKind::Close, Payload::None)
    }

    /// Terminate the target
    fn exit(&self) -> bool {
        self.command(EventKind::Exit, Payload::None)
    }

    /// Request the active configuration
    fn get_config(&self) -> bool {
        self.command(EventKind::GetConfig, Payload::None)
    }

    /// Replace the active configuration
    fn update_config(&self, config: AppConfig) -> bool {
        self.command(EventKind::UpdateConfig, Payload::Config(Box::new(config)))
    }

    /// Request the loaded program
    fn get_gcode(&self) -> bool {
        self.command(EventKind::GetGcode, Payload::None)
    }

    /// Request the active breakpoint set
    fn get_breakpoints(&self) -> bool {
        self.command(EventKind::GetBreakpoints, Payload::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{mailbox, Mailbox, MailboxSender};

    struct Loopback {
        id: ActorId,
        tx: MailboxSender,
        listeners: ListenerRegistry,
    }

    impl CommandSurface for Loopback {
        fn post(&self, event: Event) -> bool {
            self.tx.deliver(event)
        }

        fn caller(&self) -> ActorId {
            self.id
        }

        fn listeners(&self) -> &ListenerRegistry {
            &self.listeners
        }
    }

    fn loopback() -> (Loopback, Mailbox) {
        let (tx, rx) = mailbox(ActorId::new());
        (
            Loopback {
                id: ActorId::new(),
                tx,
                listeners: ListenerRegistry::new(),
            },
            rx,
        )
    }

    #[test]
    fn test_commands_carry_caller() {
        let (surface, rx) = loopback();
        assert!(surface.stop());
        let event = rx.try_recv().expect("open").expect("queued");
        assert_eq!(event.kind, EventKind::Stop);
        assert_eq!(event.sender, surface.caller());
    }

    #[test]
    fn test_send_picks_kind_from_ack_flag() {
        let (surface, rx) = loopback();
        surface.send("$X", false);
        surface.send("G0 X1", true);
        let first = rx.try_recv().expect("open").expect("queued");
        let second = rx.try_recv().expect("open").expect("queued");
        assert_eq!(first.kind, EventKind::Send);
        assert_eq!(second.kind, EventKind::SendWithAck);
        assert_eq!(second.payload.as_text(), Some("G0 X1"));
    }

    #[test]
    fn test_jog_kind_matrix() {
        let (surface, rx) = loopback();
        let jog = JogRequest::default();
        surface.jog_move(jog, false, false);
        surface.jog_move(jog, true, false);
        surface.jog_move(jog, false, true);
        surface.jog_move(jog, true, true);
        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok().flatten())
            .map(|event| event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::JogMove,
                EventKind::JogMoveRelative,
                EventKind::JogRapidMove,
                EventKind::JogRapidMoveRelative,
            ]
        );
    }

    #[test]
    fn test_open_without_settings_has_no_payload() {
        let (surface, rx) = loopback();
        surface.open(None);
        let event = rx.try_recv().expect("open").expect("queued");
        assert_eq!(event.payload, Payload::None);
    }
}
