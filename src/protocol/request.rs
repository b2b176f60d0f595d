//! JSON-RPC request and response bodies.
//!
//! # Request
//!
//! ```json
//! {"jsonrpc":"2.0","params":[true],"id":"<uuid>","method":"Dump"}
//! ```
//!
//! # Response
//!
//! Any JSON object carrying a `result` key. Only `result` is kept; callers
//! receive `{"result": <value>}` with every object's keys in wire order.

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// JSON-RPC version string sent with every request.
pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// RpcRequest
// ============================================================================

/// A JSON-RPC request.
///
/// Field order matches the wire format.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,

    /// Positional parameters.
    pub params: Vec<Value>,

    /// Fresh per request; not checked against the response.
    pub id: RequestId,

    /// Remote method name.
    pub method: String,
}

impl RpcRequest {
    /// Creates a request with a generated id.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            params,
            id: RequestId::generate(),
            method: method.into(),
        }
    }

    /// Serializes the request body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if a parameter fails to serialize.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ============================================================================
// Response Extraction
// ============================================================================

/// Extracts `{"result": <value>}` from a response body.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the body is not a JSON object or has no
/// `result` key.
pub fn extract_result(body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::protocol(format!("response is not valid JSON: {e}")))?;

    let Value::Object(mut object) = value else {
        return Err(Error::protocol("response is not a JSON object"));
    };

    let result = object
        .remove("result")
        .ok_or_else(|| Error::protocol("result field not found in response"))?;

    let mut wrapped = Map::with_capacity(1);
    wrapped.insert("result".to_string(), result);
    Ok(Value::Object(wrapped))
}

// ============================================================================
// Tests
// ============================================================================
