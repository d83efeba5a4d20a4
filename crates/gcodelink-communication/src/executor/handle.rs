//! Executor threads and handles

use std::sync::Arc;
use std::thread::JoinHandle;

use gcodelink_core::{
    mailbox, ActorId, AppConfig, CommandSurface, Error, Event, EventSink, ListenerRegistry,
    MailboxSender, Result,
};
use parking_lot::RwLock;

use super::actor::Executor;
use super::state::{ExecSnapshot, ExecState};
use crate::communication::ChannelOpener;
use crate::firmware::DeviceProtocol;

/// Cloneable command surface of a running executor
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    id: ActorId,
    tx: MailboxSender,
    listeners: ListenerRegistry,
    snapshot: Arc<RwLock<ExecSnapshot>>,
    caller: ActorId,
}

impl ExecutorHandle {
    /// Id of the executor actor
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Copy of this handle stamping commands with `caller`
    pub fn with_caller(&self, caller: ActorId) -> Self {
        Self {
            caller,
            ..self.clone()
        }
    }

    /// Current execution state
    pub fn state(&self) -> ExecState {
        self.snapshot.read().state
    }

    /// Program counter as of the last notification
    pub fn pc(&self) -> usize {
        self.snapshot.read().pc
    }

    /// True while the executor holds an open device channel
    pub fn port_open(&self) -> bool {
        self.snapshot.read().port_open
    }

    /// Full progress snapshot
    pub fn snapshot(&self) -> ExecSnapshot {
        *self.snapshot.read()
    }
}

impl CommandSurface for ExecutorHandle {
    fn post(&self, event: Event) -> bool {
        self.tx.deliver(event)
    }

    fn caller(&self) -> ActorId {
        self.caller
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}

/// A program executor running on its own thread
///
/// Dropping it asks the executor to exit without waiting; [`shutdown`]
/// waits for the thread.
///
/// [`shutdown`]: ProgramExecutor::shutdown
#[derive(Debug)]
pub struct ProgramExecutor {
    handle: ExecutorHandle,
    thread: Option<JoinHandle<()>>,
}

impl ProgramExecutor {
    /// Start an executor for `device`, opening channels through `opener`
    pub fn spawn(
        config: AppConfig,
        device: Box<dyn DeviceProtocol>,
        opener: Arc<dyn ChannelOpener>,
    ) -> Result<Self> {
        let id = ActorId::new();
        let (tx, rx) = mailbox(id);
        let listeners = ListenerRegistry::new();
        let snapshot = Arc::new(RwLock::new(ExecSnapshot::default()));

        let executor = Executor::new(
            rx,
            listeners.clone(),
            snapshot.clone(),
            config,
            device,
            opener,
        );
        let thread = std::thread::Builder::new()
            .name("gcodelink-executor".to_string())
            .spawn(move || executor.run_loop())
            .map_err(|e| Error::other(format!("Failed to spawn executor thread: {}", e)))?;

        tracing::debug!("Spawned executor {}", id);
        Ok(Self {
            handle: ExecutorHandle {
                id,
                tx,
                listeners,
                snapshot,
                caller: ActorId::new(),
            },
            thread: Some(thread),
        })
    }

    /// Handle for sending commands and registering listeners
    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    /// Id of the executor actor
    pub fn id(&self) -> ActorId {
        self.handle.id
    }

    /// True once the executor thread has returned
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Ask the executor to exit and wait for its thread
    pub fn shutdown(mut self) {
        self.handle.exit();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Executor {} thread panicked", self.handle.id);
            }
        }
    }
}

impl std::ops::Deref for ProgramExecutor {
    type Target = ExecutorHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for ProgramExecutor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.handle.exit();
        }
    }
}
