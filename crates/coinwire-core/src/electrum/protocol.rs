use serde_json::Value;

use crate::error::CoreError;

/// Method names of the ElectrumX protocol used by this crate.
pub(super) mod method {
    pub const SERVER_VERSION: &str = "server.version";
    pub const SERVER_PING: &str = "server.ping";
    pub const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
    pub const BLOCK_HEADER: &str = "blockchain.block.header";
    pub const BLOCK_HEADERS: &str = "blockchain.block.headers";
    pub const SCRIPTHASH_BALANCE: &str = "blockchain.scripthash.get_balance";
    pub const SCRIPTHASH_HISTORY: &str = "blockchain.scripthash.get_history";
    pub const SCRIPTHASH_LISTUNSPENT: &str = "blockchain.scripthash.listunspent";
    pub const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
    pub const SCRIPTHASH_UNSUBSCRIBE: &str = "blockchain.scripthash.unsubscribe";
    pub const TRANSACTION_GET: &str = "blockchain.transaction.get";
    pub const TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
    pub const TRANSACTION_GET_MERKLE: &str = "blockchain.transaction.get_merkle";
}

#[derive(serde::Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

/// Any line the server sends: a response (has `id`) or a notification
/// (has `method`, no `id`).
#[derive(serde::Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug)]
pub(super) enum Frame {
    Response {
        id: u64,
        result: Result<Value, CoreError>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

/// Serialize one request as a newline-terminated frame.
pub(super) fn encode_request(id: u64, method: &str, params: &[Value]) -> Result<Vec<u8>, CoreError> {
    let mut frame = serde_json::to_vec(&JsonRpcRequest {
        jsonrpc: "2.0",
        id,
        method,
        params,
    })
    .map_err(|e| CoreError::Protocol(format!("encode {method} request: {e}")))?;
    frame.push(b'\n');
    Ok(frame)
}

pub(super) fn decode_frame(line: &str) -> Result<Frame, CoreError> {
    let incoming: Incoming = serde_json::from_str(line)
        .map_err(|e| CoreError::Protocol(format!("decode frame: {e}")))?;

    match (incoming.id, incoming.method) {
        (Some(id), _) if !id.is_null() => {
            let id = parse_id(&id)?;
            let result = match incoming.error {
                Some(err) if !err.is_null() => Err(parse_jsonrpc_error(err)),
                _ => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            Ok(Frame::Response { id, result })
        }
        (_, Some(method)) => {
            let params = match incoming.params {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items,
                Some(other) => vec![other],
            };
            Ok(Frame::Notification { method, params })
        }
        _ => Err(CoreError::Protocol(
            "frame is neither a response nor a notification".into(),
        )),
    }
}

/// Parse a JSON-RPC error value into a structured `CoreError`.
///
/// ElectrumX reports `{"code": <int>, "message": <string>}`; anything else
/// is kept as raw text.
pub(super) fn parse_jsonrpc_error(err: Value) -> CoreError {
    #[derive(serde::Deserialize)]
    struct JsonRpcError {
        code: i64,
        message: String,
    }

    match serde_json::from_value::<JsonRpcError>(err.clone()) {
        Ok(parsed) => CoreError::ServerError {
            code: parsed.code,
            message: parsed.message,
        },
        Err(_) => match err {
            Value::String(message) => CoreError::ServerError { code: 0, message },
            other => CoreError::Protocol(format!("non-standard JSON-RPC error: {other}")),
        },
    }
}

fn parse_id(id: &Value) -> Result<u64, CoreError> {
    if let Some(n) = id.as_u64() {
        return Ok(n);
    }

    if let Some(s) = id.as_str() {
        return s
            .parse::<u64>()
            .map_err(|e| CoreError::Protocol(format!("invalid response id string: {e}")));
    }

    Err(CoreError::Protocol(format!("invalid response id: {id}")))
}
