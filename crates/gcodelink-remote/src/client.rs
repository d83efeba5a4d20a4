//! Transport client
//!
//! [`RemoteClient`] connects to a transport server and implements
//! [`CommandSurface`], so its owner drives it exactly like a local
//! executor handle. Commands go out stamped with the client's id; every
//! event received from the server is re-emitted to the client's listeners
//! unchanged. HELLO, GOODBYE and EXIT are handled locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use gcodelink_core::{
    ActorId, CommandSurface, Event, EventKind, ListenerRegistry, Payload, ServerInfo,
};
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{TransportError, TransportResult};
use crate::framing::{decode_frame, encode_frame, FrameCodec};

/// State shared between the client and its I/O tasks
#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    server: Mutex<Option<(ActorId, ServerInfo)>>,
    /// Fingerprint the server last reported as loaded
    loaded_fingerprint: Mutex<Option<String>>,
}

/// Client end of the transport
#[derive(Debug)]
pub struct RemoteClient {
    id: ActorId,
    outbound: mpsc::UnboundedSender<Event>,
    listeners: ListenerRegistry,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    header_width: usize,
}

impl RemoteClient {
    /// Connect over raw TCP
    pub async fn connect_tcp(addr: &str, header_width: usize) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new(header_width));
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(header_width));

        let (client, mut outbound) = Self::unconnected(header_width);
        let id = client.id;
        let writer_task = tokio::spawn(async move {
            while let Some(event) = outbound.recv().await {
                if let Err(e) = writer.send(event).await {
                    tracing::warn!("Client {}: write failed: {}", id, e);
                    break;
                }
            }
        });

        let listeners = client.listeners.clone();
        let shared = client.shared.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(event)) => receive(&listeners, &shared, event),
                    Some(Err(e)) => {
                        tracing::warn!("Client {}: {}", id, e);
                        break;
                    }
                    None => break,
                }
            }
            connection_lost(&listeners, &shared, id);
        });

        client.tasks.lock().extend([writer_task, reader_task]);
        tracing::info!("Client {} connected to {}", id, addr);
        Ok(client)
    }

    /// Connect over WebSocket, e.g. `ws://host:port/?token=secret`
    pub async fn connect_ws(url: &str, header_width: usize) -> TransportResult<Self> {
        let (ws, _) = match tokio_tungstenite::connect_async(url).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED =>
            {
                return Err(TransportError::Unauthorized);
            }
            Err(e) => return Err(TransportError::WebSocket(Box::new(e))),
        };
        let (mut sink, mut source) = ws.split();

        let (client, mut outbound) = Self::unconnected(header_width);
        let id = client.id;
        let writer_task = tokio::spawn(async move {
            while let Some(event) = outbound.recv().await {
                let frame = match encode_frame(&event, header_width) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Client {}: {}", id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    tracing::warn!("Client {}: write failed: {}", id, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let listeners = client.listeners.clone();
        let shared = client.shared.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Client {}: {}", id, e);
                        break;
                    }
                };
                match decode_frame(&frame, header_width) {
                    Ok(event) => receive(&listeners, &shared, event),
                    Err(e) => {
                        tracing::warn!("Client {}: {}", id, e);
                        break;
                    }
                }
            }
            connection_lost(&listeners, &shared, id);
        });

        client.tasks.lock().extend([writer_task, reader_task]);
        tracing::info!("Client {} connected to {}", id, url);
        Ok(client)
    }

    fn unconnected(header_width: usize) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);
        let client = Self {
            id: ActorId::new(),
            outbound,
            listeners: ListenerRegistry::new(),
            shared,
            tasks: Mutex::new(Vec::new()),
            header_width,
        };
        (client, rx)
    }

    /// Also receive broadcasts sent as UDP datagrams to `port`
    pub async fn listen_udp(&self, port: u16) -> TransportResult<()> {
        let addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let listeners = self.listeners.clone();
        let shared = self.shared.clone();
        let header_width = self.header_width;
        let id = self.id;

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => match decode_frame(&buf[..n], header_width) {
                        Ok(event) => receive(&listeners, &shared, event),
                        Err(e) => tracing::debug!("Client {}: bad datagram from {}: {}", id, from, e),
                    },
                    Err(e) => {
                        tracing::warn!("Client {}: UDP receive failed: {}", id, e);
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Id stamped on commands from this client
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// True until the connection is lost or closed
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Identity announced by the server, once HELLO has arrived
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server.lock().as_ref().map(|(_, info)| info.clone())
    }

    /// Actor id the server stamps on its events, once HELLO has arrived
    pub fn server_id(&self) -> Option<ActorId> {
        self.shared.server.lock().as_ref().map(|(id, _)| *id)
    }

    /// Close the connection and notify GOODBYE locally
    pub fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        connection_lost(&self.listeners, &self.shared, self.id);
    }

    fn forward(&self, event: Event) -> bool {
        if !self.is_connected() {
            tracing::debug!("Client {} not connected, dropping {}", self.id, event.kind);
            return false;
        }
        self.outbound.send(event.restamped(self.id)).is_ok()
    }

    /// Omit program content the server has confirmed it holds
    fn elide_known_program(&self, event: Event) -> Event {
        let Event {
            kind,
            payload,
            sender,
        } = event;
        let payload = match payload {
            Payload::Run(request) if request.program.is_some() => {
                let loaded = self.shared.loaded_fingerprint.lock();
                if loaded.as_deref() == Some(request.fingerprint.as_str()) {
                    tracing::debug!("Program {} already loaded, omitting content", request.fingerprint);
                    Payload::Run(request.without_content())
                } else {
                    Payload::Run(request)
                }
            }
            other => other,
        };
        Event::new(kind, payload, sender)
    }
}

impl CommandSurface for RemoteClient {
    fn post(&self, event: Event) -> bool {
        match event.kind {
            EventKind::Exit => {
                self.disconnect();
                true
            }
            EventKind::Hello | EventKind::Goodbye => {
                tracing::debug!("Client {} ignoring local {}", self.id, event.kind);
                true
            }
            EventKind::Run | EventKind::Step => {
                let event = self.elide_known_program(event);
                self.forward(event)
            }
            _ => self.forward(event),
        }
    }

    fn caller(&self) -> ActorId {
        self.id
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn receive(listeners: &ListenerRegistry, shared: &Shared, event: Event) {
    match (&event.kind, &event.payload) {
        (EventKind::Hello, Payload::Welcome(info)) => {
            tracing::info!("Connected to {} {} on {}", info.name, info.version, info.host);
            *shared.server.lock() = Some((event.sender, info.clone()));
            *shared.loaded_fingerprint.lock() = None;
        }
        (EventKind::ProgramLoaded, Payload::Text(fingerprint)) => {
            *shared.loaded_fingerprint.lock() = Some(fingerprint.clone());
        }
        (EventKind::ProgramUnknown, _) | (EventKind::PortClose | EventKind::Abort, _) => {
            *shared.loaded_fingerprint.lock() = None;
        }
        _ => {}
    }
    listeners.notify(&event);
}

fn connection_lost(listeners: &ListenerRegistry, shared: &Shared, id: ActorId) {
    if shared.connected.swap(false, Ordering::SeqCst) {
        tracing::info!("Client {} disconnected", id);
        listeners.notify(&Event::bare(EventKind::Goodbye, id));
    }
}
