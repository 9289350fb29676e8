use std::io::BufRead;
#[cfg(unix)]
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

/// Failure talking to the player's IPC endpoint. Callers treat any variant
/// as "position unavailable" for that request; none of them are fatal.
#[derive(Debug, Error)]
pub(crate) enum IpcError {
    #[error("IPC endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("malformed IPC response: {0}")]
    Protocol(String),
    #[error("player rejected command: {0}")]
    Rejected(String),
}

#[cfg(unix)]
const READ_TIMEOUT: Duration = Duration::from_secs(2);

// mpv broadcasts event lines to every connected client; a reply can be
// preceded by a burst of them.
const MAX_EVENT_LINES: usize = 32;

/// Send one command over a fresh connection and return the reply's `data`.
pub(crate) fn request(endpoint: &str, command: &Value) -> Result<Value, IpcError> {
    let payload = json!({ "command": command }).to_string();
    let raw = exchange(endpoint, &payload)?;
    parse_response(&raw)
}

/// Extract `data` from an mpv `{"error": ..., "data": ...}` reply line.
pub(crate) fn parse_response(raw: &str) -> Result<Value, IpcError> {
    let reply: Value =
        serde_json::from_str(raw.trim()).map_err(|err| IpcError::Protocol(err.to_string()))?;
    match reply.get("error").and_then(Value::as_str) {
        Some("success") => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
        Some(error) => Err(IpcError::Rejected(error.to_string())),
        None => Err(IpcError::Protocol("reply carries no error field".to_string())),
    }
}

fn read_reply_line<R: BufRead>(mut reader: R) -> Result<String, IpcError> {
    for _ in 0..MAX_EVENT_LINES {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| IpcError::Unavailable(err.to_string()))?;
        if read == 0 {
            return Err(IpcError::Protocol(
                "connection closed before a reply arrived".to_string(),
            ));
        }
        if !is_event_line(&line) {
            return Ok(line);
        }
    }
    Err(IpcError::Protocol(format!(
        "no reply within {MAX_EVENT_LINES} lines"
    )))
}

fn is_event_line(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw)
        .map(|value| value.get("event").is_some())
        .unwrap_or(false)
}

#[cfg(unix)]
fn exchange(endpoint: &str, payload: &str) -> Result<String, IpcError> {
    use std::io::{BufReader, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(endpoint)
        .map_err(|err| IpcError::Unavailable(format!("{endpoint}: {err}")))?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|err| IpcError::Unavailable(err.to_string()))?;
    stream
        .write_all(payload.as_bytes())
        .and_then(|()| stream.write_all(b"\n"))
        .map_err(|err| IpcError::Unavailable(err.to_string()))?;
    read_reply_line(BufReader::new(stream))
}

#[cfg(windows)]
fn exchange(endpoint: &str, payload: &str) -> Result<String, IpcError> {
    use std::fs::OpenOptions;
    use std::io::{BufReader, Write};

    // Pipe reads block; mpv either answers or closes its end.
    let mut pipe = OpenOptions::new()
        .read(true)
        .write(true)
        .open(endpoint)
        .map_err(|err| IpcError::Unavailable(format!("{endpoint}: {err}")))?;
    pipe.write_all(payload.as_bytes())
        .and_then(|()| pipe.write_all(b"\n"))
        .map_err(|err| IpcError::Unavailable(err.to_string()))?;
    read_reply_line(BufReader::new(pipe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_extracts_data() {
        let data = parse_response(r#"{"error":"success","data":42.5}"#).expect("reply is valid");
        assert_eq!(data.as_f64(), Some(42.5));
    }

    #[test]
    fn parse_response_success_without_data_is_null() {
        let data = parse_response(r#"{"error":"success"}"#).expect("reply is valid");
        assert!(data.is_null());
    }

    #[test]
    fn parse_response_maps_player_errors() {
        let err = parse_response(r#"{"error":"property unavailable"}"#)
            .expect_err("non-success must be an error");
        assert!(matches!(err, IpcError::Rejected(_)));
    }

    #[test]
    fn parse_response_rejects_garbage() {
        assert!(matches!(
            parse_response("not json"),
            Err(IpcError::Protocol(_))
        ));
        assert!(matches!(
            parse_response(r#"{"data": 1}"#),
            Err(IpcError::Protocol(_))
        ));
    }

    #[test]
    fn reply_reader_skips_event_lines() {
        let input = concat!(
            "{\"event\":\"property-change\"}\n",
            "{\"event\":\"pause\"}\n",
            "{\"error\":\"success\",\"data\":7}\n",
        );
        let line = read_reply_line(input.as_bytes()).expect("reply line should be found");
        let data = parse_response(&line).expect("reply is valid");
        assert_eq!(data.as_i64(), Some(7));
    }

    #[test]
    fn reply_reader_errors_on_closed_connection() {
        let err = read_reply_line("".as_bytes()).expect_err("empty input has no reply");
        assert!(matches!(err, IpcError::Protocol(_)));
    }

    #[cfg(unix)]
    #[test]
    fn request_reports_unavailable_endpoint() {
        let err = request("/nonexistent/mpv.sock", &json!(["get_property", "pause"]))
            .expect_err("endpoint must be unreachable");
        assert!(matches!(err, IpcError::Unavailable(_)));
    }
}
