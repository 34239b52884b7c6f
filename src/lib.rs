//! Pinwire - length-framed connector protocol engine
//!
//! Client and server roles for a request/response, notify and push
//! protocol with handshake negotiation, heartbeats and route compression.

pub mod config;
pub mod network;
pub mod protocol;

pub use config::Config;
pub use network::{
    Client, ClientConfig, ClientError, ClientEvent, HandlerTable, Server, ServerConfig,
    ServerError, ServerEvent, SessionContext,
};
