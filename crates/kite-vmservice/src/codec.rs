//! JSON-RPC 2.0 messages, one JSON document per line.

use base64::Engine as _;
use serde_json::{json, Map, Value};

use super::types::{
    Breakpoint, IsolateRef, OutputStream, PauseKind, Result, VmEvent, VmServiceError,
};

/// Upper bound on a single incoming message, checked before the line is
/// handed to the JSON parser.
pub const MAX_MESSAGE_BYTES: u64 = 64 * 1024 * 1024;

pub(crate) const STREAM_NOTIFY: &str = "streamNotify";

#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        result: std::result::Result<Value, RpcErrorObject>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

pub(crate) fn encode_request(id: u64, method: &str, params: Value) -> Vec<u8> {
    let msg = json!({
        "jsonrpc": "2.0",
        "id": id.to_string(),
        "method": method,
        "params": params,
    });
    let mut line = msg.to_string().into_bytes();
    line.push(b'\n');
    line
}

pub(crate) fn decode_message(line: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(mut obj) = value else {
        return Err(VmServiceError::Protocol(
            "expected a JSON object".to_string(),
        ));
    };

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        if obj.get("id").is_none() {
            let method = method.to_string();
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Ok(Incoming::Notification { method, params });
        }
        return Err(VmServiceError::Protocol(format!(
            "unsupported server request {method:?}"
        )));
    }

    let id = match obj.get("id") {
        Some(Value::String(s)) => s.parse::<u64>().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    }
    .ok_or_else(|| VmServiceError::Protocol("response without a usable id".to_string()))?;

    if let Some(err) = obj.remove("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32000);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Ok(Incoming::Response {
            id,
            result: Err(RpcErrorObject { code, message }),
        });
    }

    Ok(Incoming::Response {
        id,
        result: Ok(obj.remove("result").unwrap_or(Value::Null)),
    })
}

/// Decode a `streamNotify` payload. Unknown event kinds yield `Ok(None)`.
pub(crate) fn decode_stream_notification(params: &Value) -> Result<Option<VmEvent>> {
    let stream_id = params
        .get("streamId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let event = params
        .get("event")
        .ok_or_else(|| VmServiceError::Protocol("streamNotify without event".to_string()))?;
    decode_event(stream_id, event)
}

pub(crate) fn decode_event(stream_id: &str, event: &Value) -> Result<Option<VmEvent>> {
    let kind = event
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| VmServiceError::Protocol("event without kind".to_string()))?;

    if kind == "WriteEvent" {
        let stream = match stream_id {
            "Stdout" => OutputStream::Stdout,
            "Stderr" => OutputStream::Stderr,
            _ => return Ok(None),
        };
        let data = event.get("bytes").and_then(Value::as_str).unwrap_or_default();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|err| VmServiceError::Protocol(format!("invalid WriteEvent bytes: {err}")))?;
        return Ok(Some(VmEvent::Write { stream, bytes }));
    }

    let isolate = match event.get("isolate") {
        Some(isolate) => parse_isolate_ref(isolate)?,
        None => return Ok(None),
    };

    if let Some(kind) = PauseKind::from_event_kind(kind) {
        let at_async_suspension = event
            .get("atAsyncSuspension")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let breakpoint_ids = event
            .get("pauseBreakpoints")
            .and_then(Value::as_array)
            .map(|bps| {
                bps.iter()
                    .filter_map(|bp| bp.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        return Ok(Some(VmEvent::Pause {
            isolate,
            kind,
            at_async_suspension,
            breakpoint_ids,
        }));
    }

    Ok(match kind {
        "IsolateStart" => Some(VmEvent::IsolateStart { isolate }),
        "IsolateRunnable" => Some(VmEvent::IsolateRunnable { isolate }),
        "IsolateExit" => Some(VmEvent::IsolateExit { isolate }),
        "Resume" => Some(VmEvent::Resume { isolate }),
        "BreakpointResolved" => {
            let breakpoint = event
                .get("breakpoint")
                .ok_or_else(|| VmServiceError::Protocol("BreakpointResolved without breakpoint".to_string()))
                .and_then(parse_breakpoint)?;
            Some(VmEvent::BreakpointResolved {
                isolate,
                breakpoint,
            })
        }
        "ServiceExtensionAdded" => event
            .get("extensionRPC")
            .and_then(Value::as_str)
            .map(|extension| VmEvent::ServiceExtensionAdded {
                isolate,
                extension: extension.to_string(),
            }),
        _ => None,
    })
}

pub(crate) fn parse_isolate_ref(value: &Value) -> Result<IsolateRef> {
    Ok(serde_json::from_value(value.clone())?)
}

pub(crate) fn parse_breakpoint(value: &Value) -> Result<Breakpoint> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| VmServiceError::Protocol("breakpoint without id".to_string()))?
        .to_string();
    let resolved = value
        .get("resolved")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let location = value.get("location");
    let script_uri = location
        .and_then(|loc| loc.get("script").and_then(|s| s.get("uri")).or_else(|| loc.get("scriptUri")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let line = location
        .and_then(|loc| loc.get("line"))
        .and_then(Value::as_u64)
        .and_then(|line| u32::try_from(line).ok());
    Ok(Breakpoint {
        id,
        resolved,
        script_uri,
        line,
    })
}

/// Build a params object, skipping `None` values.
pub(crate) fn params(entries: impl IntoIterator<Item = (&'static str, Option<Value>)>) -> Value {
    let mut map = Map::new();
    for (key, value) in entries {
        if let Some(value) = value {
            map.insert(key.to_string(), value);
        }
    }
    Value::Object(map)
}
