//! Content-Length framed JSON-RPC messages, as spoken by language servers.

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Frames larger than this are rejected rather than buffered.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Read one message. Returns `Ok(None)` on a clean EOF between messages.
///
/// An oversize frame is skipped and reported as [`ProtocolError::Malformed`].
/// A header block with no usable length yields [`ProtocolError::Framing`],
/// after which the stream cannot be read further.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Value>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if saw_header {
                return Err(ProtocolError::Framing("eof inside headers".to_string()));
            }
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        if let Some((header, value)) = trimmed.split_once(':')
            && header.trim().eq_ignore_ascii_case("Content-Length")
        {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|e| ProtocolError::Framing(format!("bad Content-Length: {e}")))?;
            content_length = Some(length);
        }
    }

    let length = content_length
        .ok_or_else(|| ProtocolError::Framing("missing Content-Length header".to_string()))?;
    if length > MAX_FRAME_BYTES {
        let skipped = tokio::io::copy(&mut (&mut *reader).take(length as u64), &mut tokio::io::sink())
            .await?;
        if skipped < length as u64 {
            return Err(ProtocolError::Framing("eof inside oversize frame".to_string()));
        }
        return Err(ProtocolError::Malformed(format!(
            "frame of {length} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0_u8; length];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Write one message and flush.
pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

pub fn response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

/// An incoming message, sorted by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply to one of our requests.
    Response {
        id: i64,
        result: Result<Value, (i64, String)>,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// The server asking us something.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
}

impl Incoming {
    pub fn parse(message: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = message else {
            return Err(ProtocolError::Malformed("message is not an object".to_string()));
        };
        let id = obj.remove("id");
        let method = obj
            .remove("method")
            .and_then(|m| m.as_str().map(str::to_string));
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                let id = id
                    .as_i64()
                    .ok_or_else(|| ProtocolError::Malformed(format!("unexpected response id {id}")))?;
                let result = match obj.remove("error") {
                    Some(err) if !err.is_null() => {
                        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                        let message = err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        Err((code, message))
                    }
                    _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, result })
            }
            (None, None) => Err(ProtocolError::Malformed(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_back_written_frames() {
        let mut buf = Vec::new();
        write_message(&mut buf, &request(1, "initialize", json!({})))
            .await
            .expect("write");
        write_message(&mut buf, &notification("initialized", json!({})))
            .await
            .expect("write");

        let mut reader = BufReader::new(buf.as_slice());
        let first = read_message(&mut reader).await.expect("read").expect("frame");
        assert_eq!(first["method"], "initialize");
        let second = read_message(&mut reader).await.expect("read").expect("frame");
        assert_eq!(second["method"], "initialized");
        assert!(read_message(&mut reader).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn tolerates_extra_headers_and_case() {
        let body = r#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        let raw = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{body}",
            body.len()
        );
        let mut reader = BufReader::new(raw.as_bytes());
        let msg = read_message(&mut reader).await.expect("read").expect("frame");
        assert_eq!(msg["id"], 7);
    }

    #[tokio::test]
    async fn missing_or_garbled_length_loses_framing() {
        let mut reader = BufReader::new("X-Other: 1\r\n\r\n{}".as_bytes());
        assert!(matches!(
            read_message(&mut reader).await,
            Err(ProtocolError::Framing(_))
        ));
        let mut reader = BufReader::new("Content-Length: ten\r\n\r\n{}".as_bytes());
        assert!(matches!(
            read_message(&mut reader).await,
            Err(ProtocolError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn oversize_frame_is_skipped_and_next_frame_reads() {
        let mut raw = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1).into_bytes();
        raw.resize(raw.len() + MAX_FRAME_BYTES + 1, b' ');
        write_message(&mut raw, &notification("after", json!({})))
            .await
            .expect("write");

        let mut reader = BufReader::new(raw.as_slice());
        assert!(matches!(
            read_message(&mut reader).await,
            Err(ProtocolError::Malformed(_))
        ));
        let next = read_message(&mut reader).await.expect("read").expect("frame");
        assert_eq!(next["method"], "after");
    }

    #[tokio::test]
    async fn invalid_json_body_is_consumed() {
        let mut raw = b"Content-Length: 5\r\n\r\n{nope".to_vec();
        write_message(&mut raw, &notification("after", json!({})))
            .await
            .expect("write");
        let mut reader = BufReader::new(raw.as_slice());
        assert!(matches!(read_message(&mut reader).await, Err(ProtocolError::Json(_))));
        let next = read_message(&mut reader).await.expect("read").expect("frame");
        assert_eq!(next["method"], "after");
    }

    #[test]
    fn parse_sorts_message_kinds() {
        assert_eq!(
            Incoming::parse(json!({"jsonrpc":"2.0","id":3,"result":{"ok":true}})).expect("parse"),
            Incoming::Response {
                id: 3,
                result: Ok(json!({"ok": true}))
            }
        );
        assert_eq!(
            Incoming::parse(json!({"id":4,"error":{"code":-32601,"message":"nope"}}))
                .expect("parse"),
            Incoming::Response {
                id: 4,
                result: Err((-32601, "nope".to_string()))
            }
        );
        assert!(matches!(
            Incoming::parse(json!({"method":"textDocument/publishDiagnostics","params":{}})),
            Ok(Incoming::Notification { .. })
        ));
        assert!(matches!(
            Incoming::parse(json!({"id":"abc","method":"workspace/configuration"})),
            Ok(Incoming::Request { .. })
        ));
        assert!(Incoming::parse(json!([1])).is_err());
    }
}
