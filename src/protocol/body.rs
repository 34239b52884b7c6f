//! Payload body codecs
//!
//! Application bodies are `serde_json::Value` at the engine boundary.
//! A proto-capable codec can be plugged in; JSON is always the fallback.

use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Body codec errors
#[derive(Error, Debug)]
pub enum BodyError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No schema for route '{0}'")]
    NoSchema(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

pub type BodyResult<T> = Result<T, BodyError>;

/// Converts application values to and from payload bytes
pub trait BodyCodec: Send + Sync {
    fn encode(&self, route: &str, value: &Value) -> BodyResult<Vec<u8>>;
    fn decode(&self, route: &str, bytes: &[u8]) -> BodyResult<Value>;
}

/// Self-describing JSON bodies
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl BodyCodec for JsonCodec {
    fn encode(&self, _route: &str, value: &Value) -> BodyResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, _route: &str, bytes: &[u8]) -> BodyResult<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Strip the server type prefix: `connector.entryHandler.hello` -> `entryHandler.hello`
pub fn normalize_route(route: &str) -> &str {
    match route.find('.') {
        Some(idx) => &route[idx + 1..],
        None => route,
    }
}

/// Codec selected from the proto descriptors negotiated at handshake
///
/// Routes with a descriptor go through the plugged-in codec; everything
/// else, and every plugin failure, falls back to JSON.
#[derive(Clone)]
pub struct NegotiatedCodec {
    encode_protos: Map<String, Value>,
    decode_protos: Map<String, Value>,
    proto: Option<Arc<dyn BodyCodec>>,
}

impl NegotiatedCodec {
    /// JSON only
    pub fn json() -> Self {
        Self {
            encode_protos: Map::new(),
            decode_protos: Map::new(),
            proto: None,
        }
    }

    pub fn new(encode_protos: Map<String, Value>, decode_protos: Map<String, Value>) -> Self {
        Self {
            encode_protos,
            decode_protos,
            proto: None,
        }
    }

    pub fn with_proto_codec(mut self, codec: Arc<dyn BodyCodec>) -> Self {
        self.proto = Some(codec);
        self
    }

    fn proto_for<'a>(
        &'a self,
        protos: &Map<String, Value>,
        route: &str,
    ) -> Option<&'a Arc<dyn BodyCodec>> {
        self.proto
            .as_ref()
            .filter(|_| protos.contains_key(normalize_route(route)))
    }

    pub fn has_encode_schema(&self, route: &str) -> bool {
        self.encode_protos.contains_key(normalize_route(route))
    }

    pub fn has_decode_schema(&self, route: &str) -> bool {
        self.decode_protos.contains_key(normalize_route(route))
    }
}

impl Default for NegotiatedCodec {
    fn default() -> Self {
        Self::json()
    }
}

impl std::fmt::Debug for NegotiatedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedCodec")
            .field("encode_protos", &self.encode_protos.len())
            .field("decode_protos", &self.decode_protos.len())
            .field("proto", &self.proto.is_some())
            .finish()
    }
}

impl BodyCodec for NegotiatedCodec {
    fn encode(&self, route: &str, value: &Value) -> BodyResult<Vec<u8>> {
        if let Some(codec) = self.proto_for(&self.encode_protos, route) {
            match codec.encode(normalize_route(route), value) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => tracing::debug!("Proto encode failed for '{}', using JSON: {}", route, e),
            }
        }
        JsonCodec.encode(route, value)
    }

    fn decode(&self, route: &str, bytes: &[u8]) -> BodyResult<Value> {
        if let Some(codec) = self.proto_for(&self.decode_protos, route) {
            match codec.decode(normalize_route(route), bytes) {
                Ok(value) => return Ok(value),
                Err(e) => tracing::debug!("Proto decode failed for '{}', using JSON: {}", route, e),
            }
        }
        JsonCodec.decode(route, bytes)
    }
}
