//! Pinwire Server
//!
//! Accepts connections, answers handshakes and heartbeats, and
//! dispatches requests and notifies to registered route handlers.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use super::connection::{
    split_stream, BoxedRead, ConnectionError, ConnectionResult, PackageReader, PackageWriter,
};
use super::dispatch::{HandlerTable, SessionContext};
use super::heartbeat::{sleep_until_wakeup, HeartbeatEvent, HeartbeatMonitor};
use super::state::{accepts, ConnectionState, Role, StateCell};
use super::{Negotiated, ServerConfig};
use crate::protocol::{
    codes, BodyCodec, HandshakeRequest, HandshakeResponse, Message, MessageError, MessageKind,
    Package, PackageType, Route, ServerSys,
};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("No session for {0}")]
    SessionNotFound(SocketAddr),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A client completed the handshake
    SessionStarted {
        addr: SocketAddr,
        client_type: String,
        client_version: String,
    },
    /// A client sent a notify
    Notify {
        addr: SocketAddr,
        route: Route,
        body: Value,
    },
    /// A session ended
    SessionClosed { addr: SocketAddr, reason: String },
    /// Server stopped
    Stopped,
}

/// Instructions for a running session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Push { route: String, body: Value },
    Kick { reason: String },
}

/// Information about a connected client
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub addr: SocketAddr,
    pub state: ConnectionState,
}

#[derive(Debug, Clone)]
struct SessionHandle {
    state: StateCell,
    commands: mpsc::Sender<SessionCommand>,
}

/// How long `stop` waits on each session's command queue
const STOP_KICK_TIMEOUT: Duration = Duration::from_secs(1);

type SessionMap = Arc<RwLock<HashMap<SocketAddr, SessionHandle>>>;

/// Everything a session borrows from its server
#[derive(Clone)]
struct SessionShared {
    config: Arc<ServerConfig>,
    handlers: Arc<HandlerTable>,
    negotiated: Arc<Negotiated>,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl SessionShared {
    fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Server event dropped: {}", e);
        }
    }
}

/// Pinwire Server
pub struct Server {
    /// Server configuration
    config: Arc<ServerConfig>,
    /// Route handlers shared with every session
    handlers: Arc<HandlerTable>,
    /// Optional binary codec used for routes with a proto descriptor
    proto_codec: Option<Arc<dyn BodyCodec>>,
    /// Live sessions
    sessions: SessionMap,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    /// Address actually bound
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server
    pub fn new(config: ServerConfig, handlers: HandlerTable) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config: Arc::new(config),
            handlers: Arc::new(handlers),
            proto_codec: None,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Use `codec` for bodies whose route has a proto descriptor
    pub fn with_proto_codec(mut self, codec: Arc<dyn BodyCodec>) -> Self {
        self.proto_codec = Some(codec);
        self
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    fn shared(&self) -> SessionShared {
        SessionShared {
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            negotiated: Arc::new(Negotiated::for_server(&self.config, self.proto_codec.clone())),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Start the server and return the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if *self.running.read().await {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Server listening on {} ({} routes, heartbeat {}s)",
            local_addr,
            self.handlers.routes().count(),
            self.config.heartbeat_secs
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        *self.running.write().await = true;

        let shared = self.shared();
        shared.emit(ServerEvent::Started { bind_addr: local_addr });

        let sessions = self.sessions.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                if let Err(e) = stream.set_nodelay(true) {
                                    tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                                }
                                let session =
                                    run_session(stream, addr, shared.clone(), sessions.clone());
                                tokio::spawn(session);
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            *running.write().await = false;
            shared.emit(ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop accepting and kick every session
    pub async fn stop(&mut self) -> ServerResult<()> {
        if !*self.running.read().await {
            return Err(ServerError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        for (addr, commands) in self.command_senders(false).await {
            let kick = SessionCommand::Kick {
                reason: "Server shutting down".to_string(),
            };
            if let Err(SendTimeoutError::Timeout(_)) =
                commands.send_timeout(kick, STOP_KICK_TIMEOUT).await
            {
                tracing::warn!("Session {} did not take the shutdown kick", addr);
            }
        }

        Ok(())
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get a list of connected clients
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(addr, handle)| SessionInfo {
                addr: *addr,
                state: handle.state.get(),
            })
            .collect()
    }

    /// Snapshot the command queues so no send happens under the lock
    async fn command_senders(
        &self,
        working_only: bool,
    ) -> Vec<(SocketAddr, mpsc::Sender<SessionCommand>)> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !working_only || handle.state.is_working())
            .map(|(addr, handle)| (*addr, handle.commands.clone()))
            .collect()
    }

    async fn command(&self, addr: SocketAddr, command: SessionCommand) -> ServerResult<()> {
        let commands = self
            .sessions
            .read()
            .await
            .get(&addr)
            .map(|handle| handle.commands.clone())
            .ok_or(ServerError::SessionNotFound(addr))?;
        commands
            .send(command)
            .await
            .map_err(|_| ServerError::SessionNotFound(addr))
    }

    /// Push a message to one client
    pub async fn push(&self, addr: SocketAddr, route: &str, body: Value) -> ServerResult<()> {
        self.command(
            addr,
            SessionCommand::Push {
                route: route.to_string(),
                body,
            },
        )
        .await
    }

    /// Push a message to every working session; returns how many were queued
    ///
    /// Never waits on a session: one whose command queue is full misses
    /// the push.
    pub async fn broadcast(&self, route: &str, body: Value) -> usize {
        let mut queued = 0;
        for (addr, commands) in self.command_senders(true).await {
            let command = SessionCommand::Push {
                route: route.to_string(),
                body: body.clone(),
            };
            match commands.try_send(command) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("Broadcast on {} dropped for {}: queue full", route, addr);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        queued
    }

    /// Send a Kick to one client and close its session
    pub async fn kick(&self, addr: SocketAddr, reason: &str) -> ServerResult<()> {
        self.command(
            addr,
            SessionCommand::Kick {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Serve one accepted connection until it closes
async fn run_session<S>(stream: S, addr: SocketAddr, shared: SessionShared, sessions: SessionMap)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let session = Session::new(stream, addr, shared);

    sessions.write().await.insert(
        addr,
        SessionHandle {
            state: session.state.clone(),
            commands: commands_tx,
        },
    );

    let reason = session.run(commands_rx).await;
    sessions.write().await.remove(&addr);
    tracing::info!("Session {} ended: {}", addr, reason);
}

enum Flow {
    Continue,
    Close(String),
}

/// Server side of one connection
struct Session {
    reader: PackageReader<BoxedRead>,
    writer: PackageWriter,
    state: StateCell,
    monitor: HeartbeatMonitor,
    ctx: SessionContext,
    shared: SessionShared,
}

impl Session {
    fn new<S>(stream: S, addr: SocketAddr, shared: SessionShared) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = split_stream(stream);
        Self {
            reader: PackageReader::new(read),
            writer: PackageWriter::new(write),
            state: StateCell::new(),
            monitor: HeartbeatMonitor::disabled(),
            ctx: SessionContext::new(addr),
            shared,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) -> String {
        let reason = loop {
            let wakeup = self.monitor.next_wakeup();

            tokio::select! {
                result = self.reader.next() => {
                    match result {
                        Ok(Some(package)) => match self.handle_package(package).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close(reason)) => break reason,
                            Err(e) => {
                                tracing::error!("Session {} error: {}", self.ctx.remote_addr, e);
                                break format!("Error: {}", e);
                            }
                        },
                        Ok(None) => break "Connection closed by client".to_string(),
                        Err(e) => break format!("Error: {}", e),
                    }
                }

                _ = sleep_until_wakeup(wakeup) => {
                    if let Some(reason) = self.on_timer().await {
                        break reason;
                    }
                }

                Some(command) = commands.recv() => {
                    if let Some(reason) = self.on_command(command).await {
                        break reason;
                    }
                }
            }
        };

        self.close(&reason).await;
        reason
    }

    async fn handle_package(&mut self, package: Package) -> ConnectionResult<Flow> {
        let state = self.state.get();
        if !accepts(Role::Server, state, package.package_type) {
            tracing::debug!(
                "Session {}: ignoring {:?} package while {}",
                self.ctx.remote_addr,
                package.package_type,
                state
            );
            return Ok(Flow::Continue);
        }

        match package.package_type {
            PackageType::Handshake => self.on_handshake(&package.body).await,
            PackageType::HandshakeAck => {
                if self.state.advance(ConnectionState::WaitAck, ConnectionState::Working) {
                    self.monitor.start(Instant::now());
                    tracing::info!(
                        "Session {} working ({} {})",
                        self.ctx.remote_addr,
                        self.ctx.client_type,
                        self.ctx.client_version
                    );
                    self.shared.emit(ServerEvent::SessionStarted {
                        addr: self.ctx.remote_addr,
                        client_type: self.ctx.client_type.clone(),
                        client_version: self.ctx.client_version.clone(),
                    });
                }
                Ok(Flow::Continue)
            }
            PackageType::Heartbeat => {
                self.monitor.on_received(Instant::now());
                self.writer.send_empty(PackageType::Heartbeat).await?;
                Ok(Flow::Continue)
            }
            PackageType::Data => {
                self.monitor.on_received(Instant::now());
                self.on_data(&package.body).await?;
                Ok(Flow::Continue)
            }
            PackageType::Kick => Ok(Flow::Close("Kicked by client".to_string())),
        }
    }

    async fn send_handshake(&mut self, response: &HandshakeResponse) -> ConnectionResult<()> {
        let body = serde_json::to_vec(response)?;
        self.writer.send(PackageType::Handshake, &body).await
    }

    async fn on_handshake(&mut self, body: &[u8]) -> ConnectionResult<Flow> {
        let request: HandshakeRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed handshake from {}: {}", self.ctx.remote_addr, e);
                self.send_handshake(&HandshakeResponse::rejected(codes::FAIL)).await?;
                return Ok(Flow::Close("Malformed handshake".to_string()));
            }
        };

        if let Some(required) = &self.shared.config.required_version {
            if request.sys.version != *required {
                tracing::warn!(
                    "Rejecting {}: client version {:?}, required {}",
                    self.ctx.remote_addr,
                    request.sys.version,
                    required
                );
                self.send_handshake(&HandshakeResponse::rejected(codes::OLD_CLIENT)).await?;
                return Ok(Flow::Close(format!(
                    "Client version {:?} rejected",
                    request.sys.version
                )));
            }
        }

        self.ctx.client_type = request.sys.client_type;
        self.ctx.client_version = request.sys.version;

        let heartbeat = self.shared.negotiated.heartbeat_secs;
        let response = HandshakeResponse::accepted(ServerSys {
            heartbeat: (heartbeat > 0).then_some(heartbeat),
            dict: Some(self.shared.negotiated.dict.to_map()),
            protos: Some(self.shared.config.protos.clone()),
        });
        self.send_handshake(&response).await?;

        if !self.state.advance(ConnectionState::Inited, ConnectionState::WaitAck) {
            return Ok(Flow::Close("Closed during handshake".to_string()));
        }
        self.monitor = HeartbeatMonitor::from_secs(heartbeat);
        Ok(Flow::Continue)
    }

    async fn on_data(&mut self, body: &[u8]) -> ConnectionResult<()> {
        let message = Message::decode(body)?;
        let negotiated = self.shared.negotiated.clone();

        match message.kind {
            MessageKind::Request | MessageKind::Notify => {
                let route = message
                    .route
                    .ok_or(MessageError::MissingRoute(message.kind))?;
                let route = negotiated.dict.resolve(route);
                let route_name = route.as_name().unwrap_or_default().to_string();
                let request = negotiated.decode_body(&route_name, &message.body);

                if message.kind == MessageKind::Request {
                    tracing::debug!(
                        "Request {} on {} from {}",
                        message.id,
                        route,
                        self.ctx.remote_addr
                    );
                    let response = self.shared.handlers.dispatch(&route, &mut self.ctx, request);
                    let payload = negotiated.codec.encode(&route_name, &response)?;
                    self.writer
                        .send_message(&Message::response(message.id, payload))
                        .await?;
                } else {
                    tracing::debug!("Notify on {} from {}", route, self.ctx.remote_addr);
                    if self.shared.handlers.contains(&route_name) {
                        self.shared.handlers.dispatch(&route, &mut self.ctx, request.clone());
                    }
                    self.shared.emit(ServerEvent::Notify {
                        addr: self.ctx.remote_addr,
                        route,
                        body: request,
                    });
                }
            }
            kind => tracing::warn!(
                "Unexpected {:?} message from client {}",
                kind,
                self.ctx.remote_addr
            ),
        }
        Ok(())
    }

    async fn on_timer(&mut self) -> Option<String> {
        for event in self.monitor.poll(Instant::now()) {
            match event {
                HeartbeatEvent::Send => {
                    if let Err(e) = self.writer.send_empty(PackageType::Heartbeat).await {
                        return Some(format!("Heartbeat error: {}", e));
                    }
                }
                HeartbeatEvent::TimedOut => {
                    tracing::warn!("Client {} heartbeat timeout", self.ctx.remote_addr);
                    return Some(ConnectionError::HeartbeatTimeout.to_string());
                }
            }
        }
        None
    }

    async fn on_command(&mut self, command: SessionCommand) -> Option<String> {
        match command {
            SessionCommand::Push { route, body } => {
                if !self.state.is_working() {
                    tracing::debug!(
                        "Push to {} dropped while {}",
                        self.ctx.remote_addr,
                        self.state.get()
                    );
                    return None;
                }
                let negotiated = &self.shared.negotiated;
                let payload = match negotiated.codec.encode(&route, &body) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Push on {} not encodable: {}", route, e);
                        return None;
                    }
                };
                let message = Message::push(negotiated.dict.encode_route(&route), payload);
                match self.writer.send_message(&message).await {
                    Ok(()) => None,
                    Err(ConnectionError::Message(e)) => {
                        tracing::warn!("Push on {} dropped: {}", route, e);
                        None
                    }
                    Err(e) => Some(format!("Send error: {}", e)),
                }
            }
            SessionCommand::Kick { reason } => {
                let body = json!({ "reason": reason }).to_string();
                if let Err(e) = self.writer.send(PackageType::Kick, body.as_bytes()).await {
                    tracing::debug!("Kick to {} not delivered: {}", self.ctx.remote_addr, e);
                }
                Some(format!("Kicked: {}", reason))
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        if !self.state.close() {
            return;
        }
        self.monitor.stop();
        self.writer.shutdown().await;
        tracing::debug!(
            "Session {} closed after {} bytes received",
            self.ctx.remote_addr,
            self.reader.bytes_received()
        );
        self.shared.emit(ServerEvent::SessionClosed {
            addr: self.ctx.remote_addr,
            reason: reason.to_string(),
        });
    }
}
