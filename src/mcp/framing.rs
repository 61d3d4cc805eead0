//! `Content-Length` framing for the stdio transport.
//!
//! A frame is `Content-Length: <N>` followed by a blank line (`\r\n\r\n` or
//! `\n\n`) and exactly `N` bytes of UTF-8 JSON. The header is only ever
//! matched at the start of the buffer.

use std::sync::OnceLock;

use regex::bytes::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::errors::AppError;

fn header_pattern() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"\AContent-Length: ([0-9]+)(?:\r\n\r\n|\n\n)").expect("valid header regex")
    })
}

/// Accumulates raw input and yields one parsed frame at a time.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next complete frame.
    ///
    /// Returns `None` when more input is needed; the buffer is left untouched
    /// in that case. A frame whose payload is not valid JSON is consumed and
    /// reported as `Some(Err(..))`, so callers can keep draining.
    pub fn next_frame(&mut self) -> Option<Result<Value, AppError>> {
        let captures = header_pattern().captures(&self.buffer)?;
        let header_len = captures.get(0)?.end();
        let payload_len = std::str::from_utf8(captures.get(1)?.as_bytes())
            .ok()
            .and_then(|digits| digits.parse::<usize>().ok())
            .and_then(|len| len.checked_add(header_len).map(|_| len));

        let Some(payload_len) = payload_len else {
            self.buffer.drain(..header_len);
            return Some(Err(AppError::transport("Content-Length is out of range")));
        };

        let frame_len = header_len + payload_len;
        if self.buffer.len() < frame_len {
            return None;
        }

        let frame = self.buffer.drain(..frame_len).collect::<Vec<_>>();
        Some(
            serde_json::from_slice(&frame[header_len..])
                .map_err(|err| AppError::transport(err.to_string())),
        )
    }
}

/// Serialises `message` and prefixes it with its UTF-8 byte length.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(message)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}
