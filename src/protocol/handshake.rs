//! Handshake payloads
//!
//! Both directions carry JSON bodies inside Handshake packages.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Handshake response codes
pub mod codes {
    pub const OK: u16 = 200;
    pub const FAIL: u16 = 500;
    pub const OLD_CLIENT: u16 = 501;
}

/// Some clients send `null` for empty sections
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Client -> server handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default)]
    pub sys: ClientSys,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSys {
    #[serde(rename = "type", default)]
    pub client_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rsa: Map<String, Value>,
    #[serde(default)]
    pub dict: Option<HashMap<String, u16>>,
    #[serde(default)]
    pub protos: Option<Map<String, Value>>,
}

impl HandshakeRequest {
    pub fn new(client_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            sys: ClientSys {
                client_type: client_type.into(),
                version: version.into(),
                ..Default::default()
            },
            user: Map::new(),
        }
    }
}

/// Server -> client handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys: Option<ServerSys>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSys {
    /// Heartbeat interval in seconds; absent or 0 disables heartbeats
    #[serde(default)]
    pub heartbeat: Option<u64>,
    #[serde(default)]
    pub dict: Option<HashMap<String, u16>>,
    #[serde(default)]
    pub protos: Option<Protos>,
}

/// Proto descriptor sets, keyed by normalized route
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protos {
    /// Messages the client encodes
    #[serde(default)]
    pub client: Map<String, Value>,
    /// Messages the server encodes
    #[serde(default)]
    pub server: Map<String, Value>,
}

impl HandshakeResponse {
    pub fn accepted(sys: ServerSys) -> Self {
        Self {
            code: codes::OK,
            sys: Some(sys),
            user: Map::new(),
        }
    }

    pub fn rejected(code: u16) -> Self {
        Self {
            code,
            sys: None,
            user: Map::new(),
        }
    }

    pub fn heartbeat_secs(&self) -> u64 {
        self.sys.as_ref().and_then(|s| s.heartbeat).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = HandshakeRequest::new("client-simulator", "0.1.0");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["sys"]["type"], "client-simulator");
        assert_eq!(value["sys"]["version"], "0.1.0");
        assert_eq!(value["sys"]["rsa"], json!({}));
        assert_eq!(value["user"], json!({}));
    }

    #[test]
    fn test_parse_request_with_nulls() {
        let body = concat!(
            r#"{"sys":{"type":"c","version":"0.1.0","rsa":null,"dict":null,"protos":null},"#,
            r#""user":null}"#
        );
        let req: HandshakeRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.sys.version, "0.1.0");
        assert!(req.sys.dict.is_none());
        assert!(req.sys.rsa.is_empty());
        assert!(req.user.is_empty());
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "code": 200,
            "sys": {
                "heartbeat": 10,
                "dict": { "connector.entryHandler.hello": 1 },
                "protos": { "client": {}, "server": { "onChat": {} } }
            },
            "user": {}
        });
        let resp: HandshakeResponse = serde_json::from_value(body).unwrap();
        assert_eq!(resp.code, codes::OK);
        assert_eq!(resp.heartbeat_secs(), 10);
        let sys = resp.sys.unwrap();
        assert_eq!(sys.dict.unwrap()["connector.entryHandler.hello"], 1);
        assert!(sys.protos.unwrap().server.contains_key("onChat"));
    }

    #[test]
    fn test_rejection_has_no_sys() {
        let value = serde_json::to_value(HandshakeResponse::rejected(codes::OLD_CLIENT)).unwrap();
        assert_eq!(value, json!({ "code": 501, "user": {} }));

        let resp: HandshakeResponse = serde_json::from_str(r#"{"code":500}"#).unwrap();
        assert_eq!(resp.heartbeat_secs(), 0);
    }
}
