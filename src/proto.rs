//! Wire frames for the daemon socket.
//!
//! Newline-delimited UTF-8 JSON in both directions. The id is chosen by the
//! client and opaque to the server; a response carries exactly one of
//! `result` or `error`, plus `cached_at` for cache-backed reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ERR_NO_DATA: &str = "No data available";
pub const ERR_REQUEST_TIMEOUT: &str = "Request timeout";
pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";

pub const METHOD_GET_PRICES: &str = "getPrices";
pub const METHOD_GET_ASSET_CTXS: &str = "getAssetCtxs";
pub const METHOD_GET_PERP_META: &str = "getPerpMeta";
pub const METHOD_GET_STATUS: &str = "getStatus";
pub const METHOD_SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<i64>,
}

impl RpcResponse {
    pub fn ok(id: &str, result: Value) -> Self {
        Self {
            id: id.to_string(),
            result: Some(result),
            error: None,
            cached_at: None,
        }
    }

    pub fn cached(id: &str, result: Value, cached_at: i64) -> Self {
        Self {
            id: id.to_string(),
            result: Some(result),
            error: None,
            cached_at: Some(cached_at),
        }
    }

    pub fn err(id: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            result: None,
            error: Some(error.into()),
            cached_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_envelope_is_exclusive() {
        let ok = RpcResponse::cached("1", json!({"BTC": "50000"}), 123);
        let line = serde_json::to_string(&ok).unwrap();
        assert!(line.contains("\"result\""));
        assert!(!line.contains("\"error\""));
        assert!(line.contains("\"cached_at\":123"));

        let err = RpcResponse::err("1", ERR_NO_DATA);
        let line = serde_json::to_string(&err).unwrap();
        assert!(line.contains("\"error\":\"No data available\""));
        assert!(!line.contains("\"result\""));
        assert!(!line.contains("cached_at"));
    }

    #[test]
    fn request_params_default_to_null() {
        let req: RpcRequest = serde_json::from_str(r#"{"id":"7","method":"getStatus"}"#).unwrap();
        assert_eq!(req.id, "7");
        assert!(req.params.is_null());
        // And null params are omitted on the wire.
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains("params"));
    }
}
