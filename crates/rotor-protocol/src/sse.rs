use bytes::Bytes;
use serde::Serialize;

/// Sentinel frame closing every OpenAI-style event stream.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Serialize `value` into a single `data: {...}\n\n` frame.
pub fn data_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(b"\n\n");
    Some(Bytes::from(frame))
}

/// Incremental parser for the `data:`-only SSE dialect the Gemini API emits
/// with `alt=sse`. Event names and ids are ignored; adjacent data lines of
/// one event are joined with newlines per the SSE spec.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw byte chunk; returns the data payloads of every event that
    /// completed within it. Non-UTF-8 chunks are dropped.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.accept_line(&line, &mut payloads);
        }
        payloads
    }

    /// Flush whatever remains once the transport closes. A final event that
    /// was never terminated by a blank line is still delivered.
    pub fn finish(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.accept_line(&line, &mut payloads);
        }
        if !self.data_lines.is_empty() {
            payloads.push(self.take_event());
        }
        payloads
    }

    fn accept_line(&mut self, line: &str, payloads: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                payloads.push(self.take_event());
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        }
        // Other fields (event:, id:, retry:) carry nothing we consume.
    }

    fn take_event(&mut self) -> String {
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        data
    }
}
