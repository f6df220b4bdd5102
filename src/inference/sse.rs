use bytes::{Buf, BytesMut};

/// Splits a chunked byte stream into complete lines.
///
/// Transport chunks can end mid-line or even mid-codepoint, so bytes are
/// held until a newline arrives. A trailing `\r` is stripped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos);
            self.buf.advance(1);
            lines.push(decode_line(&line));
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(decode_line(&rest))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Payload of an SSE `data:` line, if this is one.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}
