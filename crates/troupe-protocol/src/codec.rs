//! Newline framing for the worker protocol.
//!
//! Worker stdout is a raw byte stream. [`LineDecoder`] splits it into
//! newline-delimited messages: a partial trailing line is buffered until the
//! next chunk arrives and is never parsed prematurely. At EOF the buffered
//! remainder (a final message the worker did not get to terminate) is
//! surfaced through [`LineDecoder::finish`].

use serde::de::DeserializeOwned;
use thiserror::Error;

/// A line that could not be decoded. Callers log and skip; a malformed line
/// must never abort the stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message line is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Incremental splitter for newline-delimited byte streams.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    ///
    /// Lines are returned without their terminating `\n` (a preceding `\r`
    /// is stripped too). Bytes after the last newline stay buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(text) => lines.push(text),
                Err(e) => log::warn!("dropping non-UTF-8 protocol line: {}", e),
            }
        }
        lines
    }

    /// Consume the decoder at EOF, returning the final undelimited line if
    /// one was buffered.
    pub fn finish(mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        match String::from_utf8(rest) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                log::warn!("dropping non-UTF-8 trailing protocol data: {}", e);
                None
            }
        }
    }

    /// Number of buffered (incomplete) bytes.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode one protocol line into a typed message.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, DecodeError> {
    Ok(serde_json::from_str(line)?)
}

/// Encode one message as a protocol line, including the trailing newline.
pub fn encode_line<T: serde::Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerMessage;

    #[test]
    fn test_single_chunk_single_line() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"{\"type\":\"error\",\"error\":\"boom\"}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_partial_line_buffers_until_complete() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"type\":\"err").is_empty());
        assert!(decoder.pending() > 0);

        let lines = decoder.push(b"or\",\"error\":\"boom\"}\nleft");
        assert_eq!(lines.len(), 1);

        let msg: WorkerMessage = decode_line(&lines[0]).unwrap();
        assert!(matches!(msg, WorkerMessage::Error { .. }));
        assert_eq!(decoder.pending(), 4);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"one\ntwo\r\nthree\n");
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_finish_returns_trailing_line() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"complete line\n{\"type\":\"complete\"}");
        let trailing = decoder.finish().unwrap();

        let msg: WorkerMessage = decode_line(&trailing).unwrap();
        assert!(matches!(msg, WorkerMessage::Complete { .. }));
    }

    #[test]
    fn test_finish_empty_and_whitespace() {
        assert!(LineDecoder::new().finish().is_none());

        let mut decoder = LineDecoder::new();
        decoder.push(b"   ");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_malformed_line_is_a_recoverable_error() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"not json\n{\"type\":\"error\",\"error\":\"x\"}\n");
        assert_eq!(lines.len(), 2);

        assert!(decode_line::<WorkerMessage>(&lines[0]).is_err());
        assert!(decode_line::<WorkerMessage>(&lines[1]).is_ok());
    }

    #[test]
    fn test_encode_line_appends_newline() {
        let line = encode_line(&WorkerMessage::Error {
            error: "x".to_string(),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
