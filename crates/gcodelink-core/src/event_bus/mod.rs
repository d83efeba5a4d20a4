//! # Event Bus Module
//!
//! Mailbox-based messaging between actors.
//!
//! ## Overview
//!
//! - Every actor owns a [`Mailbox`] and drains it cooperatively
//! - Unicast commands are appended with [`MailboxSender::add_event`]
//! - Notifications fan out through a [`ListenerRegistry`]
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use gcodelink_core::event_bus::{mailbox, ActorId, EventKind, ListenerRegistry, Payload};
//!
//! let ui = ActorId::new();
//! let (ui_tx, ui_rx) = mailbox(ui);
//!
//! let listeners = ListenerRegistry::new();
//! listeners.add_listener(ui, Arc::new(ui_tx));
//!
//! let executor = ActorId::new();
//! listeners.notify_listeners(executor, EventKind::PcUpdate, Payload::Pc(3));
//!
//! let event = ui_rx.try_recv().unwrap().unwrap();
//! assert_eq!(event.payload.as_pc(), Some(3));
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
