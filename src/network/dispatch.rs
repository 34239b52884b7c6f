//! Route handler table for the server role

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::Route;

/// Per-session data handlers can read and update
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub remote_addr: SocketAddr,
    /// Client type and version from the handshake
    pub client_type: String,
    pub client_version: String,
    /// Free-form per-session storage
    pub data: Map<String, Value>,
}

impl SessionContext {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            client_type: String::new(),
            client_version: String::new(),
            data: Map::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }
}

/// Produces a response body for a request body
pub trait RouteHandler: Send + Sync {
    fn handle(&self, ctx: &mut SessionContext, body: Value) -> Value;
}

impl<F> RouteHandler for F
where
    F: Fn(&mut SessionContext, Value) -> Value + Send + Sync,
{
    fn handle(&self, ctx: &mut SessionContext, body: Value) -> Value {
        self(ctx, body)
    }
}

/// Response body for a route nobody registered
pub fn not_found(route: &Route) -> Value {
    json!({
        "code": 404,
        "msg": format!("Route not found: {}", route),
    })
}

/// Route name -> handler
///
/// Owned by the server and shared with every session.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn RouteHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, route: impl Into<String>, handler: H) -> &mut Self
    where
        H: RouteHandler + 'static,
    {
        let route = route.into();
        if self.handlers.insert(route.clone(), Arc::new(handler)).is_some() {
            tracing::warn!("Handler for '{}' replaced", route);
        }
        self
    }

    pub fn contains(&self, route: &str) -> bool {
        self.handlers.contains_key(route)
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run the handler for `route`
    ///
    /// Unknown and unresolved routes get a 404 body instead of an error.
    pub fn dispatch(&self, route: &Route, ctx: &mut SessionContext, body: Value) -> Value {
        let handler = route.as_name().and_then(|name| self.handlers.get(name));
        match handler {
            Some(handler) => handler.handle(ctx, body),
            None => {
                tracing::warn!("Unknown route: {}", route);
                not_found(route)
            }
        }
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// The `connector.entryHandler.hello` echo: counts requests per session
pub fn hello_handler(ctx: &mut SessionContext, mut body: Value) -> Value {
    let count = ctx.get("reqId").and_then(Value::as_u64).unwrap_or(0) + 1;
    ctx.set("reqId", json!(count));

    if let Value::Object(map) = &mut body {
        map.insert("serverReqId".to_string(), json!(count));
    }
    json!({ "code": 0, "msg": body })
}
