//! Incremental decoder for `text/event-stream` bodies.
//!
//! Only `data` fields are kept; the agent names its events inside the JSON
//! payload.

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// The last pushed byte was `\r`, so a leading `\n` in the next chunk
    /// belongs to the same line ending.
    pending_cr: bool,
}

impl SseDecoder {
    /// Append a chunk. `\r\n` and bare `\r` line endings are stored as `\n`.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.reserve(chunk.len());
        for &byte in chunk {
            let pending_cr = std::mem::replace(&mut self.pending_cr, false);
            match byte {
                b'\n' if pending_cr => {}
                b'\r' => {
                    self.buffer.push(b'\n');
                    self.pending_cr = true;
                }
                _ => self.buffer.push(byte),
            }
        }
    }

    /// Data of the next complete event. Comment-only and empty events
    /// (keep-alives) are consumed and skipped.
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            let idx = self
                .buffer
                .windows(2)
                .position(|window| window == b"\n\n")?;
            let block = self.buffer.drain(..idx + 2).collect::<Vec<_>>();
            if let Some(data) = parse_block(&String::from_utf8_lossy(&block[..idx])) {
                return Some(data);
            }
        }
    }
}

fn parse_block(text: &str) -> Option<String> {
    let mut data = Vec::new();

    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            data.push(value);
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(data.join("\n"))
}
