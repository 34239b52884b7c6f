//! Pinwire Client
//!
//! Connects to a server, performs the handshake and exchanges
//! request/response, notify and push messages.

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{timeout, Instant};

use super::connection::{
    split_stream, BoxedRead, ConnectionError, ConnectionResult, PackageReader, PackageWriter,
};
use super::heartbeat::{sleep_until_wakeup, HeartbeatEvent, HeartbeatMonitor};
use super::registry::{RequestRegistry, Resolution};
use super::state::{accepts, ConnectionState, Role, StateCell};
use super::{ClientConfig, Negotiated};
use crate::protocol::{
    codes, BodyCodec, HandshakeRequest, HandshakeResponse, Message, MessageError, MessageKind,
    Package, PackageType, Route,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,

    #[error("Route must not be empty")]
    EmptyRoute,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed
    Connected { heartbeat_secs: u64 },
    /// Server-initiated message
    Push { route: Route, body: Value },
    /// Server kicked this client
    Kicked { reason: String },
    /// Nothing heard from the server within the heartbeat timeout
    HeartbeatTimeout,
    /// Connection closed
    Disconnected { reason: String },
}

type HandshakeOutcome = ConnectionResult<Arc<Negotiated>>;

/// One live connection
struct Link {
    writer: PackageWriter,
    state: StateCell,
    registry: RequestRegistry,
    negotiated: Arc<Negotiated>,
    shutdown_tx: mpsc::Sender<()>,
}

impl Link {
    fn ensure_working(&self) -> ConnectionResult<()> {
        match self.state.get() {
            ConnectionState::Working => Ok(()),
            other => Err(ConnectionError::NotWorking(other)),
        }
    }

    async fn request(
        &self,
        route: &str,
        body: &Value,
        wait: std::time::Duration,
    ) -> ConnectionResult<Value> {
        self.ensure_working()?;

        let payload = self.negotiated.codec.encode(route, body)?;
        let id = self.registry.next_id();
        let message = Message::request(id, self.negotiated.dict.encode_route(route), payload);
        // Encode before registering so an oversized route leaves nothing behind
        let encoded = message.encode()?;

        let rx = self.registry.register(id, route);
        if let Err(e) = self.writer.send(PackageType::Data, &encoded).await {
            self.registry.cancel(id);
            return Err(e);
        }
        tracing::debug!("Request {} -> {}", id, route);

        match timeout(wait, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.registry.cancel(id);
                tracing::warn!("Request {} to {} timed out", id, route);
                Err(ConnectionError::RequestTimeout)
            }
        }
    }

    async fn notify(&self, route: &str, body: &Value) -> ConnectionResult<()> {
        self.ensure_working()?;

        let payload = self.negotiated.codec.encode(route, body)?;
        let message = Message::notify(self.negotiated.dict.encode_route(route), payload);
        self.writer.send_message(&message).await
    }
}

/// Pinwire Client
pub struct Client {
    /// Client configuration
    config: ClientConfig,
    /// Optional binary codec used for routes with a proto descriptor
    proto_codec: Option<Arc<dyn BodyCodec>>,
    /// Event sender
    event_tx: mpsc::Sender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Current connection, if any
    link: Arc<RwLock<Option<Arc<Link>>>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            proto_codec: None,
            event_tx,
            event_rx: Some(event_rx),
            link: Arc::new(RwLock::new(None)),
        }
    }

    /// Use `codec` for bodies whose route has a proto descriptor
    pub fn with_proto_codec(mut self, codec: Arc<dyn BodyCodec>) -> Self {
        self.proto_codec = Some(codec);
        self
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to a server by address
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        self.ensure_disconnected().await?;

        tracing::info!("Connecting to {}", server_addr);

        let connect = TcpStream::connect(server_addr);
        let stream = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };
        stream.set_nodelay(true)?;

        self.connect_stream(stream).await
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<()> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Run the handshake over an already-open stream
    pub async fn connect_stream<S>(&self, stream: S) -> ClientResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.ensure_disconnected().await?;

        let (read, write) = split_stream(stream);
        let writer = PackageWriter::new(write);
        let state = StateCell::new();
        let registry = RequestRegistry::new();

        let mut request = HandshakeRequest::new(&self.config.client_type, &self.config.version);
        request.user = self.config.user.clone();
        let body = serde_json::to_vec(&request).map_err(ConnectionError::from)?;
        writer.send(PackageType::Handshake, &body).await?;

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let driver = Driver {
            reader: PackageReader::new(read),
            writer: writer.clone(),
            state: state.clone(),
            registry: registry.clone(),
            monitor: HeartbeatMonitor::disabled(),
            negotiated: None,
            handshake_tx: Some(handshake_tx),
            event_tx: self.event_tx.clone(),
            proto_codec: self.proto_codec.clone(),
            close_on_heartbeat_timeout: self.config.close_on_heartbeat_timeout,
        };
        tokio::spawn(driver.run(shutdown_rx));

        let negotiated = match timeout(self.config.handshake_timeout, handshake_rx).await {
            Ok(Ok(Ok(negotiated))) => negotiated,
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(_)) => return Err(ConnectionError::Closed.into()),
            Err(_) => {
                tracing::warn!("No handshake response within {:?}", self.config.handshake_timeout);
                let _ = shutdown_tx.send(()).await;
                return Err(ConnectionError::HandshakeTimeout.into());
            }
        };

        *self.link.write().await = Some(Arc::new(Link {
            writer,
            state,
            registry,
            negotiated,
            shutdown_tx,
        }));

        Ok(())
    }

    async fn ensure_disconnected(&self) -> ClientResult<()> {
        match &*self.link.read().await {
            Some(link) if !link.state.is_closed() => Err(ClientError::AlreadyConnected),
            _ => Ok(()),
        }
    }

    async fn current_link(&self) -> ClientResult<Arc<Link>> {
        self.link.read().await.clone().ok_or(ClientError::NotConnected)
    }

    /// Send a request and wait for its response body
    pub async fn request(&self, route: &str, body: Value) -> ClientResult<Value> {
        if route.is_empty() {
            return Err(ClientError::EmptyRoute);
        }
        let link = self.current_link().await?;
        Ok(link.request(route, &body, self.config.request_timeout).await?)
    }

    /// Send a notify; no response is expected
    pub async fn notify(&self, route: &str, body: Value) -> ClientResult<()> {
        if route.is_empty() {
            return Err(ClientError::EmptyRoute);
        }
        let link = self.current_link().await?;
        Ok(link.notify(route, &body).await?)
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) -> ClientResult<()> {
        let link = self.link.write().await.take().ok_or(ClientError::NotConnected)?;
        if link.state.is_closed() {
            return Err(ClientError::NotConnected);
        }
        // The driver may already be gone; that's a disconnect too
        let _ = link.shutdown_tx.send(()).await;
        Ok(())
    }

    /// Current connection state, if a connection was made
    pub async fn state(&self) -> Option<ConnectionState> {
        self.link.read().await.as_ref().map(|link| link.state.get())
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.state().await == Some(ConnectionState::Working)
    }

    /// Settings agreed on in the last handshake
    pub async fn negotiated(&self) -> Option<Arc<Negotiated>> {
        self.link.read().await.as_ref().map(|link| link.negotiated.clone())
    }

    /// Requests still waiting for a response
    pub async fn pending_requests(&self) -> usize {
        self.link
            .read()
            .await
            .as_ref()
            .map_or(0, |link| link.registry.pending())
    }
}

enum Flow {
    Continue,
    Close(String),
}

/// Owns the read side and the timers of one connection
struct Driver {
    reader: PackageReader<BoxedRead>,
    writer: PackageWriter,
    state: StateCell,
    registry: RequestRegistry,
    monitor: HeartbeatMonitor,
    negotiated: Option<Arc<Negotiated>>,
    handshake_tx: Option<oneshot::Sender<HandshakeOutcome>>,
    event_tx: mpsc::Sender<ClientEvent>,
    proto_codec: Option<Arc<dyn BodyCodec>>,
    close_on_heartbeat_timeout: bool,
}

impl Driver {
    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        let reason = loop {
            let wakeup = self.monitor.next_wakeup();

            tokio::select! {
                result = self.reader.next() => {
                    match result {
                        Ok(Some(package)) => match self.handle_package(package).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close(reason)) => break reason,
                            Err(e) => {
                                tracing::error!("Connection error: {}", e);
                                break format!("Error: {}", e);
                            }
                        },
                        Ok(None) => break "Connection closed by server".to_string(),
                        Err(e) => {
                            tracing::error!("Read error: {}", e);
                            break format!("Error: {}", e);
                        }
                    }
                }

                _ = sleep_until_wakeup(wakeup) => {
                    if let Some(reason) = self.on_timer().await {
                        break reason;
                    }
                }

                _ = shutdown_rx.recv() => {
                    break "Client disconnect requested".to_string();
                }
            }
        };

        self.close(reason).await;
    }

    async fn handle_package(&mut self, package: Package) -> ConnectionResult<Flow> {
        let state = self.state.get();
        if !accepts(Role::Client, state, package.package_type) {
            tracing::debug!("Ignoring {:?} package while {}", package.package_type, state);
            return Ok(Flow::Continue);
        }

        match package.package_type {
            PackageType::Handshake => self.on_handshake(&package.body).await,
            PackageType::Heartbeat => {
                tracing::trace!("Heartbeat received");
                self.monitor.on_received(Instant::now());
                Ok(Flow::Continue)
            }
            PackageType::Data => {
                self.monitor.on_received(Instant::now());
                self.on_data(&package.body)?;
                Ok(Flow::Continue)
            }
            PackageType::Kick => {
                let reason = kick_reason(&package.body);
                tracing::warn!("Kicked by server: {}", reason);
                self.emit(ClientEvent::Kicked { reason: reason.clone() });
                Ok(Flow::Close(format!("Kicked: {}", reason)))
            }
            PackageType::HandshakeAck => Ok(Flow::Continue),
        }
    }

    async fn on_handshake(&mut self, body: &[u8]) -> ConnectionResult<Flow> {
        let response: HandshakeResponse = match serde_json::from_slice(body) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Malformed handshake response: {}", e);
                HandshakeResponse::rejected(codes::FAIL)
            }
        };

        let rejection = match response.code {
            codes::OK => None,
            codes::OLD_CLIENT => Some(ConnectionError::VersionRejected),
            code => Some(ConnectionError::HandshakeRejected(code)),
        };
        if let Some(e) = rejection {
            tracing::error!("Handshake failed: {}", e);
            let reason = e.to_string();
            self.finish_handshake(Err(e));
            return Ok(Flow::Close(reason));
        }

        let negotiated = Arc::new(Negotiated::for_client(&response, self.proto_codec.clone()));
        self.writer.send_empty(PackageType::HandshakeAck).await?;

        if !self.state.advance(ConnectionState::Inited, ConnectionState::Working) {
            return Ok(Flow::Close("Closed during handshake".to_string()));
        }
        self.monitor = HeartbeatMonitor::from_secs(negotiated.heartbeat_secs);
        self.monitor.start(Instant::now());

        tracing::info!(
            "Handshake complete (heartbeat {}s, {} dictionary routes)",
            negotiated.heartbeat_secs,
            negotiated.dict.len()
        );

        self.negotiated = Some(negotiated.clone());
        self.emit(ClientEvent::Connected {
            heartbeat_secs: negotiated.heartbeat_secs,
        });
        self.finish_handshake(Ok(negotiated));
        Ok(Flow::Continue)
    }

    fn on_data(&mut self, body: &[u8]) -> ConnectionResult<()> {
        let message = Message::decode(body)?;
        let Some(negotiated) = self.negotiated.clone() else {
            return Ok(());
        };

        match message.kind {
            MessageKind::Response => {
                let resolution = self.registry.resolve(message.id, |pending| {
                    tracing::debug!(
                        "Response {} after {:?}",
                        message.id,
                        pending.created_at.elapsed()
                    );
                    negotiated.decode_body(&pending.route, &message.body)
                });
                if resolution == Resolution::UnknownId {
                    tracing::debug!("Response for unknown request id {}", message.id);
                }
            }
            MessageKind::Push => {
                let route = message.route.ok_or(MessageError::MissingRoute(MessageKind::Push))?;
                let route = negotiated.dict.resolve(route);
                let name = route.as_name().unwrap_or_default();
                let value = negotiated.decode_body(name, &message.body);
                tracing::debug!("Push on {}", route);
                self.emit(ClientEvent::Push { route, body: value });
            }
            kind => tracing::warn!("Unexpected {:?} message from server", kind),
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
                    tracing::warn!("Server heartbeat timeout");
                    self.emit(ClientEvent::HeartbeatTimeout);
                    if self.close_on_heartbeat_timeout {
                        return Some(ConnectionError::HeartbeatTimeout.to_string());
                    }
                }
            }
        }
        None
    }

    fn finish_handshake(&mut self, outcome: HandshakeOutcome) {
        if let Some(tx) = self.handshake_tx.take() {
            let _ = tx.send(outcome);
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Client event dropped: {}", e);
        }
    }

    async fn close(mut self, reason: String) {
        if !self.state.close() {
            return;
        }
        self.monitor.stop();
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            tracing::debug!("Cancelled {} pending requests", cancelled);
        }
        self.writer.shutdown().await;
        self.finish_handshake(Err(ConnectionError::Closed));

        tracing::info!(
            "Disconnected after {} bytes received: {}",
            self.reader.bytes_received(),
            reason
        );
        self.emit(ClientEvent::Disconnected { reason });
    }
}

fn kick_reason(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("reason").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Protos, ServerSys};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Scripted server end of a duplex pipe
    struct FakeServer {
        reader: PackageReader<BoxedRead>,
        writer: PackageWriter,
    }

    impl FakeServer {
        fn new(stream: DuplexStream) -> Self {
            let (read, write) = split_stream(stream);
            Self {
                reader: PackageReader::new(read),
                writer: PackageWriter::new(write),
            }
        }

        async fn expect(&mut self, package_type: PackageType) -> Package {
            let package = self.reader.next().await.unwrap().unwrap();
            assert_eq!(package.package_type, package_type);
            package
        }

        async fn accept(&mut self, sys: ServerSys) {
            let hs = self.expect(PackageType::Handshake).await;
            let request: HandshakeRequest = serde_json::from_slice(&hs.body).unwrap();
            assert_eq!(request.sys.client_type, "pinwire-client");

            let response = serde_json::to_vec(&HandshakeResponse::accepted(sys)).unwrap();
            self.writer.send(PackageType::Handshake, &response).await.unwrap();
            self.expect(PackageType::HandshakeAck).await;
        }

        async fn expect_message(&mut self) -> Message {
            let package = self.expect(PackageType::Data).await;
            Message::decode(&package.body).unwrap()
        }
    }

    fn pair() -> (DuplexStream, FakeServer) {
        let (client, server) = tokio::io::duplex(4096);
        (client, FakeServer::new(server))
    }

    fn sys(heartbeat: u64) -> ServerSys {
        ServerSys {
            heartbeat: Some(heartbeat),
            dict: None,
            protos: None,
        }
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = Client::new(ClientConfig::default());
        assert!(!client.is_connected().await);
        assert_eq!(client.state().await, None);
        assert!(matches!(
            client.request("a.b.c", json!({})).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_handshake_and_request() {
        let (stream, mut server) = pair();
        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();

        let server_task = tokio::spawn(async move {
            server.accept(sys(10)).await;
            let request = server.expect_message().await;
            assert_eq!(request.id, 1);
            assert_eq!(request.route, Some(Route::name("connector.entryHandler.hello")));
            let reply = Message::response(request.id, &br#"{"code":0}"#[..]);
            server.writer.send_message(&reply).await.unwrap();
            server
        });

        client.connect_stream(stream).await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(client.negotiated().await.unwrap().heartbeat_secs, 10);
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Connected { heartbeat_secs: 10 })
        ));

        let response = client
            .request("connector.entryHandler.hello", json!({ "data": "world1" }))
            .await
            .unwrap();
        assert_eq!(response, json!({ "code": 0 }));
        assert_eq!(client.pending_requests().await, 0);

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_version_rejected() {
        let (stream, mut server) = pair();
        let client = Client::new(ClientConfig::default());

        tokio::spawn(async move {
            server.expect(PackageType::Handshake).await;
            let rejected = HandshakeResponse::rejected(codes::OLD_CLIENT);
            let response = serde_json::to_vec(&rejected).unwrap();
            server.writer.send(PackageType::Handshake, &response).await.unwrap();
            // Client must not acknowledge
            assert!(server.reader.next().await.unwrap().is_none());
        });

        let err = client.connect_stream(stream).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::VersionRejected)));
        assert_eq!(client.state().await, None);
    }

    #[tokio::test]
    async fn test_other_rejection_code() {
        let (stream, mut server) = pair();
        let client = Client::new(ClientConfig::default());

        tokio::spawn(async move {
            server.expect(PackageType::Handshake).await;
            let response = serde_json::to_vec(&HandshakeResponse::rejected(codes::FAIL)).unwrap();
            server.writer.send(PackageType::Handshake, &response).await.unwrap();
            let _ = server.reader.next().await;
        });

        let err = client.connect_stream(stream).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::HandshakeRejected(500))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (stream, server) = pair();
        let client = Client::new(ClientConfig::default());

        let err = client.connect_stream(stream).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::HandshakeTimeout)
        ));
        drop(server);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_cleans_registry() {
        let (stream, mut server) = pair();
        let client = Client::new(ClientConfig::default());

        let server_task = tokio::spawn(async move {
            server.accept(sys(0)).await;
            server.expect_message().await;
            server
        });

        client.connect_stream(stream).await.unwrap();
        let err = client.request("silent.handler.x", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::RequestTimeout)));
        assert_eq!(client.pending_requests().await, 0);
        assert!(client.is_connected().await);

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_route_too_long_leaves_no_entry() {
        let (stream, mut server) = pair();
        let client = Client::new(ClientConfig::default());

        let server_task = tokio::spawn(async move {
            server.accept(sys(0)).await;
            server
        });
        client.connect_stream(stream).await.unwrap();

        let route = "r".repeat(256);
        let err = client.request(&route, json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::Message(_))
        ));
        assert_eq!(client.pending_requests().await, 0);
        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_push_with_compressed_route_and_kick() {
        let (stream, mut server) = pair();
        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();

        let mut dict = HashMap::new();
        dict.insert("onChat".to_string(), 7);
        let server_task = tokio::spawn(async move {
            server
                .accept(ServerSys {
                    heartbeat: Some(0),
                    dict: Some(dict),
                    protos: Some(Protos::default()),
                })
                .await;
            let push = Message::push(Route::Code(7), &br#"{"msg":"hi"}"#[..]);
            server.writer.send_message(&push).await.unwrap();
            let unknown = Message::push(Route::Code(99), &b"{}"[..]);
            server.writer.send_message(&unknown).await.unwrap();
            server
                .writer
                .send(PackageType::Kick, br#"{"reason":"maintenance"}"#)
                .await
                .unwrap();
            server
        });

        client.connect_stream(stream).await.unwrap();
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));

        match events.recv().await {
            Some(ClientEvent::Push { route, body }) => {
                assert_eq!(route, Route::name("onChat"));
                assert_eq!(body, json!({ "msg": "hi" }));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await {
            Some(ClientEvent::Push { route, .. }) => assert_eq!(route, Route::Unresolved(99)),
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await {
            Some(ClientEvent::Kicked { reason }) => assert_eq!(reason, "maintenance"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(events.recv().await, Some(ClientEvent::Disconnected { .. })));
        assert_eq!(client.state().await, Some(ConnectionState::Closed));

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (stream, mut server) = pair();
        let client = Client::new(ClientConfig::default());

        let server_task = tokio::spawn(async move {
            server.accept(sys(0)).await;
            server.expect_message().await;
            // hang up without answering
        });

        client.connect_stream(stream).await.unwrap();
        let err = client.request("a.b.c", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::Closed)));
        server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_reports_without_closing() {
        let (stream, mut server) = pair();
        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();

        let server_task = tokio::spawn(async move {
            server.accept(sys(1)).await;
            server
        });
        client.connect_stream(stream).await.unwrap();
        let mut server = server_task.await.unwrap();

        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));
        assert!(matches!(events.recv().await, Some(ClientEvent::HeartbeatTimeout)));
        assert!(client.is_connected().await);

        // Heartbeats keep going after the timeout: 1s, then 3s
        server.expect(PackageType::Heartbeat).await;
        server.expect(PackageType::Heartbeat).await;
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_response_for_unknown_id_is_ignored() {
        let (stream, mut server) = pair();
        let client = Client::new(ClientConfig::default());

        let server_task = tokio::spawn(async move {
            server.accept(sys(0)).await;
            let request = server.expect_message().await;
            let stray = Message::response(request.id + 40, &br#"{"code":1}"#[..]);
            server.writer.send_message(&stray).await.unwrap();
            let reply = Message::response(request.id, &br#"{"code":0}"#[..]);
            server.writer.send_message(&reply).await.unwrap();
            server
        });

        client.connect_stream(stream).await.unwrap();
        let response = client.request("a.b.c", json!({})).await.unwrap();
        assert_eq!(response, json!({ "code": 0 }));
        assert!(client.is_connected().await);
        let _server = server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_can_close() {
        let (stream, mut server) = pair();
        let config = ClientConfig {
            close_on_heartbeat_timeout: true,
            ..Default::default()
        };
        let mut client = Client::new(config);
        let mut events = client.take_event_receiver().unwrap();

        let server_task = tokio::spawn(async move {
            server.accept(sys(1)).await;
            server
        });
        client.connect_stream(stream).await.unwrap();
        let _server = server_task.await.unwrap();

        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));
        assert!(matches!(events.recv().await, Some(ClientEvent::HeartbeatTimeout)));
        assert!(matches!(events.recv().await, Some(ClientEvent::Disconnected { .. })));
        assert_eq!(client.state().await, Some(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (stream, mut server) = pair();
        let client = Client::new(ClientConfig::default());

        let server_task = tokio::spawn(async move {
            server.accept(sys(0)).await;
            assert!(server.reader.next().await.unwrap().is_none());
        });

        client.connect_stream(stream).await.unwrap();
        client.disconnect().await.unwrap();
        assert!(matches!(client.disconnect().await, Err(ClientError::NotConnected)));
        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_kick_reason() {
        assert_eq!(kick_reason(br#"{"reason":"bye"}"#), "bye");
        assert_eq!(kick_reason(b"plain"), "plain");
    }
}
