//! Network module - Drives the protocol over TCP (or any byte stream)
//!
//! Provides:
//! - Client (connection initiator) with request/notify and push events
//! - Server (connection acceptor) dispatching requests to a handler table
//! - The shared state machine, heartbeat monitor and package I/O

mod client;
mod connection;
mod dispatch;
mod heartbeat;
mod registry;
mod server;
mod state;

pub use client::*;
pub use connection::*;
pub use dispatch::*;
pub use heartbeat::*;
pub use registry::*;
pub use server::*;
pub use state::*;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{
    BodyCodec, HandshakeResponse, NegotiatedCodec, Protos, RouteDictionary, DEFAULT_PORT,
    PROTOCOL_VERSION,
};

/// Configuration for the connecting side
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Time allowed for the handshake response
    pub handshake_timeout: Duration,
    /// Time a request waits for its response
    pub request_timeout: Duration,
    /// `sys.type` in the handshake
    pub client_type: String,
    /// `sys.version` in the handshake
    pub version: String,
    /// `user` section of the handshake
    pub user: Map<String, Value>,
    /// Close the connection on heartbeat timeout instead of only reporting it
    pub close_on_heartbeat_timeout: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_type: "pinwire-client".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            user: Map::new(),
            close_on_heartbeat_timeout: false,
        }
    }
}

/// Configuration for the accepting side
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to
    pub bind_address: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Heartbeat interval advertised to clients, in seconds
    pub heartbeat_secs: u64,
    /// Route compression dictionary advertised to clients
    pub dict: HashMap<String, u16>,
    /// Proto descriptors advertised to clients
    pub protos: Protos,
    /// Reject clients whose handshake version differs
    pub required_version: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            heartbeat_secs: 10,
            dict: HashMap::new(),
            protos: Protos::default(),
            required_version: None,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    pub fn with_route(mut self, route: impl Into<String>, code: u16) -> Self {
        self.dict.insert(route.into(), code);
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Settings agreed on during the handshake
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Heartbeat interval in seconds; 0 disables heartbeats
    pub heartbeat_secs: u64,
    pub dict: RouteDictionary,
    pub codec: NegotiatedCodec,
}

impl Negotiated {
    /// Client view: encode with the client protos, decode with the server protos
    pub fn for_client(response: &HandshakeResponse, proto: Option<Arc<dyn BodyCodec>>) -> Self {
        let sys = response.sys.clone().unwrap_or_default();
        let protos = sys.protos.unwrap_or_default();
        Self {
            heartbeat_secs: sys.heartbeat.unwrap_or(0),
            dict: RouteDictionary::from_map(sys.dict.unwrap_or_default()),
            codec: with_proto(NegotiatedCodec::new(protos.client, protos.server), proto),
        }
    }

    /// Server view: encode with the server protos, decode with the client protos
    pub fn for_server(config: &ServerConfig, proto: Option<Arc<dyn BodyCodec>>) -> Self {
        let protos = config.protos.clone();
        Self {
            heartbeat_secs: config.heartbeat_secs,
            dict: RouteDictionary::from_map(config.dict.clone()),
            codec: with_proto(NegotiatedCodec::new(protos.server, protos.client), proto),
        }
    }

    /// Decode a payload, logging and yielding `null` when it is malformed
    pub fn decode_body(&self, route: &str, bytes: &[u8]) -> Value {
        match self.codec.decode(route, bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Undecodable body for '{}': {}", route, e);
                Value::Null
            }
        }
    }
}

fn with_proto(codec: NegotiatedCodec, proto: Option<Arc<dyn BodyCodec>>) -> NegotiatedCodec {
    match proto {
        Some(proto) => codec.with_proto_codec(proto),
        None => codec,
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
