//! Request envelopes and response parsing
//!
//! The client only needs three things from a protocol: a way to turn
//! `(path, params, id)` into a payload, a way to turn that payload into bytes
//! and back, and a response shaped as an object with optional `id`, `result`
//! and `error` keys. Everything else about the wire format stays behind the
//! [`RequestFormatter`] and [`Packer`] traits.

use bytes::Bytes;
use rpc_core::{Result, RpcError};
use serde_json::{json, Value};

/// Build the rpc path `service + separator + method`
pub fn rpc_path(service: &str, method: &str, separator: &str) -> Result<String> {
    if service.is_empty() {
        return Err(RpcError::MissingServiceName {
            method: method.to_string(),
        });
    }
    Ok(format!("{}{}{}", service, separator, method))
}

/// Builds the protocol payload of a request
pub trait RequestFormatter: Send + Sync {
    fn format_request(&self, path: &str, params: &[Value], id: Option<&str>) -> Value;
}

/// JSON-RPC 2.0 request objects
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcFormatter;

impl RequestFormatter for JsonRpcFormatter {
    fn format_request(&self, path: &str, params: &[Value], id: Option<&str>) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": path,
            "params": params,
            "id": id,
        })
    }
}

/// Serializes payloads to and from transport frames
pub trait Packer: Send + Sync {
    fn pack(&self, payload: &Value) -> Result<Bytes>;
    fn unpack(&self, data: &[u8]) -> Result<Value>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPacker;

impl Packer for JsonPacker {
    fn pack(&self, payload: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(payload)?))
    }

    fn unpack(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A structurally valid response
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl RpcResponse {
    /// Read the response fields, or `None` if the value is not an object.
    ///
    /// Numeric ids compare by their decimal text. `result` and `error` count
    /// as present when the key exists, even with a `null` value.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };

        let id = match fields.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };

        Some(Self {
            id,
            result: fields.remove("result"),
            error: fields.remove("error"),
        })
    }

    /// `result` wins over `error`; `None` when neither key was present
    pub fn into_outcome(self) -> Option<CallOutcome> {
        match (self.result, self.error) {
            (Some(result), _) => Some(CallOutcome::Result(result)),
            (None, Some(error)) => Some(CallOutcome::Error(error)),
            (None, None) => None,
        }
    }
}

/// What a call returned: the remote result or an application-level error
/// payload. Application errors are data, not failures of the call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Result(Value),
    Error(Value),
}

impl CallOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, CallOutcome::Error(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            CallOutcome::Result(value) => Some(value),
            CallOutcome::Error(_) => None,
        }
    }

    pub fn into_result(self) -> std::result::Result<Value, Value> {
        match self {
            CallOutcome::Result(value) => Ok(value),
            CallOutcome::Error(error) => Err(error),
        }
    }
}
