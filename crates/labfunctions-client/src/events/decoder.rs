//! Incremental reassembly of SSE frames from arbitrary network reads.

use std::collections::VecDeque;

/// Record terminator: a line followed by an empty line.
const FRAME_TERMINATOR: &str = "\n\n";

/// Splits raw body chunks into complete frames.
///
/// Bytes are held until a full line arrives; lines accumulate into the
/// current frame, which is flushed exactly once when its tail reaches the
/// terminator, however the reads were split.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes of a line whose `\n` has not arrived yet.
    partial: Vec<u8>,
    /// Current, not yet terminated frame.
    frame: String,
    ready: VecDeque<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        // Held bytes never contain `\n`, so only the new chunk is scanned.
        let mut search_from = self.partial.len();
        self.partial.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.partial[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let mut line = &self.partial[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            search_from = start;
            self.push_line(&line);
        }
        self.partial.drain(..start);
    }

    fn push_line(&mut self, line: &str) {
        // Blank lines between records are not frames.
        if line.is_empty() && self.frame.is_empty() {
            return;
        }
        self.frame.push_str(line);
        self.frame.push('\n');
        if self.frame.ends_with(FRAME_TERMINATOR) {
            self.ready.push_back(std::mem::take(&mut self.frame));
        }
    }

    /// Next complete frame, oldest first.
    pub fn next_frame(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// True when a frame or line is still waiting for more bytes.
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty() || !self.frame.is_empty()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.frame.clear();
        self.ready.clear();
    }
}
