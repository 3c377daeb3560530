//! Framing codec: turns raw transport text into protocol frames and back.
//!
//! Everything here is pure and synchronous. Malformed input is reported as a
//! [`CodecError`], never a panic, so a misbehaving server cannot take down a
//! read loop.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    JSONRPC_VERSION,
};

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Why a unit of input could not become a [`Frame`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame is missing the \"jsonrpc\": \"2.0\" tag")]
    VersionMismatch,

    /// A response that carries both `result` and `error`, or neither, or an
    /// undecodable error object. The id is kept so the pending request can be
    /// rejected instead of left to time out.
    #[error("invalid response for request {id}: {reason}")]
    InvalidResponse { id: RequestId, reason: String },

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse one newline-delimited unit into a frame.
pub fn parse_frame(line: &str) -> Result<Frame, CodecError> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| CodecError::Malformed(e.to_string()))?;
    frame_from_value(value)
}

/// Classify an already-decoded JSON value.
pub fn frame_from_value(value: Value) -> Result<Frame, CodecError> {
    let Value::Object(mut obj) = value else {
        return Err(CodecError::NotAnObject);
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(CodecError::VersionMismatch);
    }

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw)
                .map_err(|_| CodecError::Violation("id must be a number or a string".into()))?,
        ),
    };

    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => return Err(CodecError::Violation("method must be a string".into())),
    };
    let params = obj.remove("params");

    match (method, id) {
        (Some(method), Some(id)) => Ok(Frame::Request(JsonRpcRequest::new(id, method, params))),
        (Some(method), None) => Ok(Frame::Notification(JsonRpcNotification::new(method, params))),
        (None, Some(id)) => parse_response(id, obj),
        (None, None) => Err(CodecError::Violation(
            "frame has neither a method nor an id".into(),
        )),
    }
}

fn parse_response(id: RequestId, mut obj: Map<String, Value>) -> Result<Frame, CodecError> {
    let result = obj.remove("result");
    let error = obj.remove("error");

    match (result, error) {
        (Some(_), Some(_)) => Err(CodecError::InvalidResponse {
            id,
            reason: "response carries both result and error".into(),
        }),
        (None, None) => Err(CodecError::InvalidResponse {
            id,
            reason: "response carries neither result nor error".into(),
        }),
        (Some(result), None) => Ok(Frame::Response(JsonRpcResponse::success(id, result))),
        (None, Some(error)) => match serde_json::from_value::<JsonRpcError>(error) {
            Ok(error) => Ok(Frame::Response(JsonRpcResponse::failure(id, error))),
            Err(e) => Err(CodecError::InvalidResponse {
                id,
                reason: format!("malformed error object: {e}"),
            }),
        },
    }
}

/// Serialize a frame as a single line (no trailing newline).
pub fn encode_frame(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Encode(e.to_string()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Newline splitting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append `chunk` to `remainder` and cut out every complete line.
///
/// Returns the complete units (blank ones skipped, `\r` stripped) and the
/// partial trailing unit to carry into the next call.
pub fn split_stream(remainder: &str, chunk: &str) -> (Vec<String>, String) {
    let mut buffer = String::with_capacity(remainder.len() + chunk.len());
    buffer.push_str(remainder);
    buffer.push_str(chunk);

    let mut units = Vec::new();
    let mut start = 0;
    while let Some(offset) = buffer[start..].find('\n') {
        let end = start + offset;
        push_unit(&mut units, &buffer[start..end]);
        start = end + 1;
    }
    let rest = buffer[start..].to_string();
    (units, rest)
}

fn push_unit(units: &mut Vec<String>, raw: &str) {
    let unit = raw.strip_suffix('\r').unwrap_or(raw);
    if !unit.trim().is_empty() {
        units.push(unit.to_string());
    }
}

/// Byte-oriented line buffer for transports reading raw chunks.
///
/// Works on bytes so a multi-byte UTF-8 sequence split across two reads is
/// reassembled before decoding. `\n` never occurs inside such a sequence.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut units = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            push_unit(&mut units, &String::from_utf8_lossy(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        units
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server-Sent Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, `"message"` when absent.
    pub event: String,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// Extract complete events from an SSE buffer.
///
/// Events are delimited by a blank line. The buffer is drained in place and
/// any trailing partial event remains for the next call. Comment lines
/// (`:keep-alive`) and events without data are dropped.
pub fn drain_sse_events(buffer: &mut String) -> Vec<SseEvent> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        let mut event = None;
        let mut id = None;
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        if data.is_empty() {
            continue;
        }
        events.push(SseEvent {
            event: event.unwrap_or_else(|| "message".into()),
            data: data.join("\n"),
            id,
        });
    }
    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_notification_response() {
        let req = parse_frame(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#).unwrap();
        assert!(matches!(req, Frame::Request(ref r) if r.method == "ping"));

        let notif =
            parse_frame(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#)
                .unwrap();
        assert!(matches!(notif, Frame::Notification(_)));

        let resp = parse_frame(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        match resp {
            Frame::Response(r) => {
                assert_eq!(r.id, RequestId::Number(3));
                assert_eq!(r.result.unwrap()["ok"], true);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn null_result_is_still_a_result() {
        let frame = parse_frame(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert!(matches!(frame, Frame::Response(ref r) if !r.is_error()));
    }

    #[test]
    fn error_response_preserves_data() {
        let frame = parse_frame(
            r#"{"jsonrpc":"2.0","id":"a","error":{"code":-32601,"message":"not found","data":{"hint":1}}}"#,
        )
        .unwrap();
        let Frame::Response(resp) = frame else {
            panic!("expected response");
        };
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.data.unwrap()["hint"], 1);
    }

    #[test]
    fn rejects_garbage_without_panicking() {
        assert!(matches!(parse_frame("booting up..."), Err(CodecError::Malformed(_))));
        assert_eq!(parse_frame("[1,2]"), Err(CodecError::NotAnObject));
        assert_eq!(
            parse_frame(r#"{"id":1,"result":{}}"#),
            Err(CodecError::VersionMismatch)
        );
        assert_eq!(
            parse_frame(r#"{"jsonrpc":"1.0","id":1,"result":{}}"#),
            Err(CodecError::VersionMismatch)
        );
        assert!(matches!(
            parse_frame(r#"{"jsonrpc":"2.0"}"#),
            Err(CodecError::Violation(_))
        ));
    }

    #[test]
    fn both_result_and_error_is_a_violation() {
        let err = parse_frame(
            r#"{"jsonrpc":"2.0","id":9,"result":{},"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidResponse { id: RequestId::Number(9), .. }));
    }

    #[test]
    fn neither_result_nor_error_is_a_violation() {
        let err = parse_frame(r#"{"jsonrpc":"2.0","id":9}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidResponse { .. }));
    }

    #[test]
    fn encode_is_single_line() {
        let frame = Frame::Request(JsonRpcRequest::new(
            1,
            "tools/call",
            Some(serde_json::json!({ "name": "echo", "arguments": { "text": "a\nb" } })),
        ));
        let line = encode_frame(&frame).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(parse_frame(&line).unwrap(), frame);
    }

    #[test]
    fn split_keeps_partial_tail() {
        let (units, rest) = split_stream("", "{\"a\":1}\n{\"b\":");
        assert_eq!(units, vec!["{\"a\":1}"]);
        assert_eq!(rest, "{\"b\":");

        let (units, rest) = split_stream(&rest, "2}\r\n\n");
        assert_eq!(units, vec!["{\"b\":2}"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn split_is_chunk_boundary_invariant() {
        let frames = [
            r#"{"jsonrpc":"2.0","id":1,"result":{"text":"héllo wörld"}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":1,"progress":0.5}}"#,
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-1,"message":"boom"}}"#,
        ];
        let whole: String = frames.iter().map(|f| format!("{f}\n")).collect();
        let (expected, rest) = split_stream("", &whole);
        assert_eq!(expected.len(), 3);
        assert!(rest.is_empty());

        let chars: Vec<char> = whole.chars().collect();
        for size in 1..=17 {
            let mut remainder = String::new();
            let mut got = Vec::new();
            for piece in chars.chunks(size) {
                let piece: String = piece.iter().collect();
                let (units, rest) = split_stream(&remainder, &piece);
                got.extend(units);
                remainder = rest;
            }
            assert_eq!(got, expected, "chunk size {size}");
            assert!(remainder.is_empty());
        }
    }

    #[test]
    fn line_buffer_reassembles_split_utf8() {
        let line = "{\"jsonrpc\":\"2.0\",\"method\":\"x\",\"params\":{\"s\":\"日本\"}}\n";
        let bytes = line.as_bytes();
        for split in 1..bytes.len() {
            let mut buf = LineBuffer::new();
            let mut got = buf.push(&bytes[..split]);
            got.extend(buf.push(&bytes[split..]));
            assert_eq!(got, vec![line.trim_end().to_string()], "split at {split}");
            assert_eq!(buf.buffered(), 0);
        }
    }

    #[test]
    fn line_buffer_finish_flushes_tail() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"jsonrpc\":\"2.0\",\"method\":\"x\"}").is_empty());
        assert_eq!(
            buf.finish().as_deref(),
            Some("{\"jsonrpc\":\"2.0\",\"method\":\"x\"}")
        );
        assert!(buf.finish().is_none());
    }

    #[test]
    fn sse_endpoint_and_message_events() {
        let mut buf = String::from(
            "event: endpoint\ndata: /messages?session=1\n\n: keep-alive\n\ndata: {\"a\":1}\n\nevent: message\ndata: par",
        );
        let events = drain_sse_events(&mut buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?session=1");
        assert_eq!(events[1].event, "message");
        assert_eq!(events[1].data, "{\"a\":1}");
        assert_eq!(buf, "event: message\ndata: par");
    }

    #[test]
    fn sse_multiline_data_and_crlf() {
        let mut buf = String::from("id: 7\r\ndata: line one\r\ndata: line two\r\n\r\n");
        let events = drain_sse_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert!(buf.is_empty());
    }

    #[test]
    fn sse_incremental_buffering() {
        let mut buf = String::from("data: chunk1");
        assert!(drain_sse_events(&mut buf).is_empty());
        buf.push_str("\n\ndata: chunk2\n\n");
        let data: Vec<_> = drain_sse_events(&mut buf).into_iter().map(|e| e.data).collect();
        assert_eq!(data, vec!["chunk1", "chunk2"]);
    }
}
