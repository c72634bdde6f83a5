/// JSON-RPC 2.0 envelope types for the MCP tool-call protocol
///
/// The gateway speaks JSON-RPC on `/mcp` in both directions: requests are
/// parsed into `JsonRpcRequest`, backend answers and policy denials are
/// emitted as `JsonRpcResponse`. Denials are ordinary HTTP 200 responses
/// carrying a JSON-RPC error object with a deterministic code.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// ERROR CODES
// ============================================================================

/// Standard JSON-RPC 2.0 codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;

/// Gateway policy codes
pub const RATE_LIMITED: i32 = -32001;
pub const QUOTA_EXCEEDED: i32 = -32002;
pub const FORBIDDEN: i32 = -32003;

/// SEP-2007 payment-required code
pub const PAYMENT_REQUIRED: i32 = -32402;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

impl JsonRpcRequest {
    /// Tool name for `tools/call` requests, if present and well-formed.
    pub fn tool_name(&self) -> Option<&str> {
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// Tool arguments object for `tools/call` requests.
    pub fn tool_arguments(&self) -> Option<&Value> {
        self.params.as_ref()?.get("arguments")
    }

    /// Serialized size of the tool arguments, used for per-KiB pricing.
    pub fn argument_bytes(&self) -> usize {
        self.tool_arguments()
            .map(|a| serde_json::to_vec(a).map(|v| v.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn error_with_data(
        id: Option<Value>,
        code: i32,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            }),
        }
    }

    /// The -32402 envelope (SEP-2007). The body carries everything a client
    /// needs to drive an automatic top-up loop.
    pub fn payment_required(
        id: Option<Value>,
        tool: &str,
        credits_needed: u64,
        credits_available: u64,
        pricing: Value,
    ) -> Self {
        Self::error_with_data(
            id,
            PAYMENT_REQUIRED,
            "insufficient_credits",
            json!({
                "tool": tool,
                "creditsNeeded": credits_needed,
                "creditsAvailable": credits_available,
                "pricing": pricing,
                "topUpEndpoint": "/topup",
                "balanceEndpoint": "/balance",
                "pricingEndpoint": "/pricing",
            }),
        )
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_call() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"text":"hi"}}}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "tools/call");
        assert_eq!(req.tool_name(), Some("echo"));
        assert!(req.argument_bytes() > 0);
    }

    #[test]
    fn test_request_without_id_is_notification() {
        let raw = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn test_payment_required_body_shape() {
        let resp = JsonRpcResponse::payment_required(
            Some(json!(7)),
            "search",
            3,
            1,
            json!({"base": 3}),
        );
        let err = resp.error.as_ref().unwrap();
        assert_eq!(err.code, PAYMENT_REQUIRED);
        assert_eq!(err.message, "insufficient_credits");
        let data = err.data.as_ref().unwrap();
        assert_eq!(data["creditsNeeded"], 3);
        assert_eq!(data["creditsAvailable"], 1);
        assert_eq!(data["topUpEndpoint"], "/topup");
        assert_eq!(data["balanceEndpoint"], "/balance");
    }

    #[test]
    fn test_error_response_omits_result() {
        let resp = JsonRpcResponse::error(Some(json!(1)), RATE_LIMITED, "rate_limited");
        let s = serde_json::to_string(&resp).unwrap();
        assert!(!s.contains("\"result\""));
        assert!(s.contains("-32001"));
    }
}
