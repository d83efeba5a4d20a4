//! Transport server
//!
//! One router task owns the single shared executor and the table of live
//! connections. Accept loops (raw TCP and, optionally, WebSocket) spawn a
//! task per connection; those tasks only frame and unframe, handing every
//! decoded event to the router and writing whatever the router queues for
//! them.
//!
//! ```text
//! client --frame--> connection task --FromClient--> router --post--> executor
//! client <--frame-- connection task <---Event------ router <--notify-- executor
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use gcodelink_communication::{spawn_executor, ChannelOpener, ProgramExecutor, SerialPortOpener};
use gcodelink_core::{
    ActorId, AppConfig, CommandSurface, Event, EventKind, Payload, ServerInfo,
};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{TransportError, TransportResult};
use crate::framing::{decode_frame, encode_frame, FrameCodec};

/// Header carrying the WebSocket token when the query string does not
pub const TOKEN_HEADER: &str = "x-gcodelink-token";

type ConnectionId = u64;

/// Input of the router task
#[derive(Debug)]
enum RouterInput {
    Connected {
        id: ConnectionId,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<Event>,
    },
    Disconnected {
        id: ConnectionId,
    },
    FromClient {
        id: ConnectionId,
        event: Event,
    },
}

/// Counters shared between the router and the server handle
#[derive(Debug, Default)]
struct ServerStats {
    executors_created: AtomicUsize,
    connections: AtomicUsize,
}

/// Transport server configuration and collaborators, not yet bound
pub struct TransportServer {
    config: AppConfig,
    opener: Arc<dyn ChannelOpener>,
}

impl TransportServer {
    /// Server driving hardware serial ports
    pub fn new(config: AppConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialPortOpener))
    }

    /// Server opening device channels through `opener`
    pub fn with_opener(config: AppConfig, opener: Arc<dyn ChannelOpener>) -> Self {
        Self { config, opener }
    }

    /// Bind the configured listeners and start serving
    pub async fn bind(self) -> TransportResult<RunningServer> {
        let remote = self.config.remote.clone();
        let tcp_addr = format!("{}:{}", remote.host, remote.port);
        let tcp = TcpListener::bind(&tcp_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: tcp_addr.clone(),
                source,
            })?;
        let local_addr = tcp.local_addr()?;
        tracing::info!("Transport server listening on {}", local_addr);

        let ws = match remote.ws_port {
            Some(port) => {
                let ws_addr = format!("{}:{}", remote.host, port);
                let listener = TcpListener::bind(&ws_addr)
                    .await
                    .map_err(|source| TransportError::Bind {
                        addr: ws_addr.clone(),
                        source,
                    })?;
                tracing::info!("WebSocket server listening on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };
        let ws_addr = match &ws {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let udp = match remote.udp_broadcast_port {
            Some(port) => Some(
                UdpBroadcaster::bind(&remote.udp_broadcast_host, port, remote.header_width)
                    .await?,
            ),
            None => None,
        };

        let id = ActorId::new();
        let stats = Arc::new(ServerStats::default());
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (executor_tx, executor_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let router = Router {
            id,
            info: ServerInfo::local(remote.server_name.clone(), env!("CARGO_PKG_VERSION")),
            config: self.config,
            opener: self.opener,
            executor: None,
            known_executors: HashSet::new(),
            executor_tx,
            connections: HashMap::new(),
            port_open: None,
            udp,
            stats: stats.clone(),
        };

        let next_id = Arc::new(AtomicU64::new(1));
        let mut tasks = vec![tokio::spawn(router.run(
            router_rx,
            executor_rx,
            shutdown_rx.clone(),
        ))];
        tasks.push(tokio::spawn(accept_tcp(
            tcp,
            remote.header_width,
            router_tx.clone(),
            next_id.clone(),
            shutdown_rx.clone(),
        )));
        if let Some(listener) = ws {
            tasks.push(tokio::spawn(accept_ws(
                listener,
                remote.header_width,
                Arc::new(remote.tokens.clone()),
                router_tx,
                next_id,
                shutdown_rx,
            )));
        }

        Ok(RunningServer {
            id,
            local_addr,
            ws_addr,
            stats,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// A bound, serving transport server
#[derive(Debug)]
pub struct RunningServer {
    id: ActorId,
    local_addr: SocketAddr,
    ws_addr: Option<SocketAddr>,
    stats: Arc<ServerStats>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Identity stamped on every event the server sends
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Address of the raw TCP listener
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the WebSocket listener, if enabled
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    /// Executors constructed since the server started
    pub fn executors_created(&self) -> usize {
        self.stats.executors_created.load(Ordering::SeqCst)
    }

    /// Live connections
    pub fn connection_count(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    /// Stop accepting, drop every connection and the executor
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Server task ended abnormally: {}", e);
            }
        }
        tracing::info!("Transport server {} stopped", self.local_addr);
    }

    /// Serve until the router stops
    pub async fn wait(mut self) {
        if !self.tasks.is_empty() {
            let router = self.tasks.remove(0);
            let _ = router.await;
        }
        self.shutdown().await;
    }
}

/// Largest UDP payload over IPv4
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Replies and program bookkeeping travel over the connections even when
/// UDP fan-out is on, so a client that does not listen on UDP still gets them
fn delivered_over_connections(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::Gcode
            | EventKind::Breakpoints
            | EventKind::Config
            | EventKind::ProgramLoaded
            | EventKind::ProgramUnknown
    )
}

/// Fans broadcasts out as datagrams to the configured broadcast address
struct UdpBroadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    header_width: usize,
}

impl UdpBroadcaster {
    async fn bind(host: &str, port: u16, header_width: usize) -> TransportResult<Self> {
        let ip: IpAddr = host.parse().map_err(|_| TransportError::Bind {
            addr: format!("{}:{}", host, port),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid broadcast address"),
        })?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| TransportError::Bind {
                addr: "0.0.0.0:0".to_string(),
                source,
            })?;
        socket.set_broadcast(true)?;
        let target = SocketAddr::new(ip, port);
        tracing::info!("Broadcasting events to {}", target);
        Ok(Self {
            socket,
            target,
            header_width,
        })
    }

    /// Send one event as a datagram
    ///
    /// Returns false when the frame is too large for a datagram or cannot
    /// be encoded, leaving delivery to the caller.
    async fn send(&self, event: &Event) -> bool {
        let frame = match encode_frame(event, self.header_width) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to frame broadcast: {}", e);
                return false;
            }
        };
        if frame.len() > MAX_DATAGRAM_SIZE {
            tracing::debug!(
                "{} frame of {} bytes exceeds a datagram, sending over connections",
                event.kind,
                frame.len()
            );
            return false;
        }
        if let Err(e) = self.socket.send_to(&frame, self.target).await {
            tracing::warn!("UDP broadcast failed: {}", e);
        }
        true
    }
}

struct Connection {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Event>,
}

/// Owner of the executor and the connection table
struct Router {
    id: ActorId,
    info: ServerInfo,
    config: AppConfig,
    opener: Arc<dyn ChannelOpener>,
    executor: Option<ProgramExecutor>,
    known_executors: HashSet<ActorId>,
    executor_tx: mpsc::UnboundedSender<Event>,
    connections: HashMap<ConnectionId, Connection>,
    port_open: Option<String>,
    udp: Option<UdpBroadcaster>,
    stats: Arc<ServerStats>,
}

impl Router {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<RouterInput>,
        mut executor_events: mpsc::UnboundedReceiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                Some(event) = executor_events.recv() => self.handle_executor_event(event).await,
                _ = shutdown.changed() => break,
            }
        }

        if let Some(executor) = self.executor.take() {
            executor.close();
            if let Err(e) = tokio::task::spawn_blocking(move || executor.shutdown()).await {
                tracing::warn!("Executor shutdown failed: {}", e);
            }
        }
        self.connections.clear();
        self.stats.connections.store(0, Ordering::SeqCst);
        tracing::debug!("Router {} stopped", self.id);
    }

    fn handle_input(&mut self, input: RouterInput) {
        match input {
            RouterInput::Connected { id, addr, tx } => {
                let hello = Event::new(EventKind::Hello, Payload::Welcome(self.info.clone()), self.id);
                let _ = tx.send(hello);
                if let Some(port) = &self.port_open {
                    let _ = tx.send(Event::new(
                        EventKind::PortOpen,
                        Payload::Text(port.clone()),
                        self.id,
                    ));
                }
                self.connections.insert(id, Connection { addr, tx });
                self.stats
                    .connections
                    .store(self.connections.len(), Ordering::SeqCst);
            }
            RouterInput::Disconnected { id } => {
                if let Some(connection) = self.connections.remove(&id) {
                    tracing::info!("Connection {} from {} closed", id, connection.addr);
                }
                self.stats
                    .connections
                    .store(self.connections.len(), Ordering::SeqCst);
            }
            RouterInput::FromClient { id, event } => self.handle_client_event(id, event),
        }
    }

    fn unicast(&mut self, id: ConnectionId, kind: EventKind, payload: Payload) {
        if let Some(connection) = self.connections.get(&id) {
            if connection.tx.send(Event::new(kind, payload, self.id)).is_err() {
                self.connections.remove(&id);
            }
        }
    }

    async fn broadcast(&mut self, event: Event) {
        let event = event.restamped(self.id);
        if let Some(udp) = &self.udp {
            if !delivered_over_connections(event.kind) && udp.send(&event).await {
                return;
            }
        }
        self.connections
            .retain(|_, connection| connection.tx.send(event.clone()).is_ok());
    }

    fn ensure_executor(&mut self) -> bool {
        if self.executor.is_none() {
            match spawn_executor(self.config.clone(), self.opener.clone()) {
                Ok(executor) => {
                    executor.add_listener(self.id, Arc::new(self.executor_tx.clone()));
                    self.known_executors.insert(executor.id());
                    self.stats.executors_created.fetch_add(1, Ordering::SeqCst);
                    tracing::info!("Created executor {}", executor.id());
                    self.executor = Some(executor);
                }
                Err(e) => {
                    tracing::error!("Failed to create executor: {}", e);
                    return false;
                }
            }
        }
        true
    }

    fn handle_client_event(&mut self, id: ConnectionId, event: Event) {
        tracing::debug!("Connection {}: {}", id, event.description());
        if !event.kind.is_command() {
            tracing::warn!("Connection {} sent notification {}, ignored", id, event.kind);
            return;
        }

        match event.kind {
            EventKind::Open => {
                if !self.ensure_executor() {
                    self.unicast(
                        id,
                        EventKind::Abort,
                        Payload::Text("executor could not be started".to_string()),
                    );
                } else if let Some(executor) = &self.executor {
                    executor.post(event);
                }
            }
            EventKind::Close => match self.executor.take() {
                Some(executor) => {
                    executor.post(event);
                    executor.exit();
                    tracing::info!("Released executor {}", executor.id());
                }
                None => tracing::warn!("CLOSE without an executor, ignored"),
            },
            EventKind::GetConfig => {
                let ports = self.opener.list_ports();
                let config = Box::new(self.config.clone());
                self.unicast(id, EventKind::Config, Payload::ConfigReport { config, ports });
            }
            EventKind::UpdateConfig => {
                if let Payload::Config(config) = &event.payload {
                    match config.validate() {
                        Ok(()) => self.config = (**config).clone(),
                        Err(e) => {
                            tracing::warn!("UPDATE_CONFIG rejected: {}", e);
                            return;
                        }
                    }
                }
                if let Some(executor) = &self.executor {
                    executor.post(event);
                }
            }
            EventKind::Exit => {
                tracing::warn!("Connection {} sent EXIT, ignored", id);
            }
            _ => match &self.executor {
                Some(executor) => {
                    executor.post(event);
                }
                None => tracing::warn!("{} ignored: no executor, send OPEN first", event.kind),
            },
        }
    }

    async fn handle_executor_event(&mut self, event: Event) {
        if !self.known_executors.contains(&event.sender) {
            tracing::debug!("Dropping event from unknown actor {}", event.sender);
            return;
        }

        let current = self.executor.as_ref().map(|e| e.id()) == Some(event.sender);
        match event.kind {
            EventKind::PortOpen => self.port_open = event.payload.as_text().map(str::to_string),
            EventKind::PortClose => {
                self.port_open = None;
                if !current {
                    self.known_executors.remove(&event.sender);
                }
            }
            EventKind::Abort => {
                self.port_open = None;
                if current {
                    self.executor = None;
                }
                self.known_executors.remove(&event.sender);
            }
            _ => {}
        }

        self.broadcast(event).await;
    }
}

async fn accept_tcp(
    listener: TcpListener,
    header_width: usize,
    router: mpsc::UnboundedSender<RouterInput>,
    next_id: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let id = next_id.fetch_add(1, Ordering::SeqCst);
                    tracing::info!("Accepted connection {} from {}", id, addr);
                    tokio::spawn(serve_tcp(stream, addr, id, header_width, router.clone(), shutdown.clone()));
                }
                Err(e) => tracing::error!("Accept failed: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_tcp(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    header_width: usize,
    router: mpsc::UnboundedSender<RouterInput>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::new(header_width));
    let mut writer = FramedWrite::new(write_half, FrameCodec::new(header_width));

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    if router.send(RouterInput::Connected { id, addr, tx }).is_err() {
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = writer.send(event).await {
                tracing::warn!("Connection {}: write failed: {}", id, e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(event)) => {
                    if router.send(RouterInput::FromClient { id, event }).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Connection {}: {}, closing", id, e);
                    break;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    let _ = router.send(RouterInput::Disconnected { id });
    write_task.abort();
}

async fn accept_ws(
    listener: TcpListener,
    header_width: usize,
    tokens: Arc<Vec<String>>,
    router: mpsc::UnboundedSender<RouterInput>,
    next_id: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let id = next_id.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_ws(
                        stream,
                        addr,
                        id,
                        header_width,
                        tokens.clone(),
                        router.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => tracing::error!("WebSocket accept failed: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Token supplied by a WebSocket client, from the query or the header
fn request_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token").then(|| value.to_string())
        })
    });
    from_query.or_else(|| {
        request
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    })
}

fn authorize(tokens: &[String], request: &Request) -> bool {
    if tokens.is_empty() {
        return true;
    }
    match request_token(request) {
        Some(token) => tokens.iter().any(|allowed| *allowed == token),
        None => false,
    }
}

async fn serve_ws(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    header_width: usize,
    tokens: Arc<Vec<String>>,
    router: mpsc::UnboundedSender<RouterInput>,
    mut shutdown: watch::Receiver<bool>,
) {
    let check = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if authorize(&tokens, request) {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(Some("unauthorized".to_string()));
            *refusal.status_mut() = StatusCode::UNAUTHORIZED;
            Err(refusal)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket handshake with {} refused: {}", addr, e);
            return;
        }
    };
    tracing::info!("Accepted WebSocket connection {} from {}", id, addr);

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    if router.send(RouterInput::Connected { id, addr, tx }).is_err() {
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match encode_frame(&event, header_width) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Connection {}: {}", id, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Binary(frame)).await {
                tracing::warn!("Connection {}: write failed: {}", id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            message = source.next() => {
                let frame = match message {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!("Connection {}: {}, closing", id, e);
                        break;
                    }
                };
                match decode_frame(&frame, header_width) {
                    Ok(event) => {
                        if router.send(RouterInput::FromClient { id, event }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Connection {}: {}, closing", id, e);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let _ = router.send(RouterInput::Disconnected { id });
    write_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, header: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = header {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(()).expect("request")
    }

    #[test]
    fn test_token_from_query_or_header() {
        assert_eq!(
            request_token(&request("/?token=abc&x=1", None)),
            Some("abc".to_string())
        );
        assert_eq!(
            request_token(&request("/", Some("xyz"))),
            Some("xyz".to_string())
        );
        assert_eq!(request_token(&request("/?other=1", None)), None);
    }

    #[test]
    fn test_authorize() {
        let tokens = vec!["secret".to_string()];
        assert!(authorize(&tokens, &request("/?token=secret", None)));
        assert!(authorize(&tokens, &request("/", Some("secret"))));
        assert!(!authorize(&tokens, &request("/?token=wrong", None)));
        assert!(!authorize(&tokens, &request("/", None)));
        assert!(authorize(&[], &request("/", None)));
    }
}
