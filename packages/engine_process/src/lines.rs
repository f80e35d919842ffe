//! Byte stream → line splitting for PTY output.
//!
//! PTY output arrives in arbitrary chunks with `\r\n` terminators and, for
//! engines that detect a terminal, ANSI colour sequences. Lines are decoded
//! only once complete so multi-byte characters split across reads survive.

/// Lines longer than this are flushed as-is to bound memory
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Incremental decoder turning raw output chunks into text lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                lines.push(decode_line(&self.pending));
                self.pending.clear();
                continue;
            }

            self.pending.push(byte);
            if self.pending.len() >= MAX_LINE_BYTES {
                lines.push(decode_line(&self.pending));
                self.pending.clear();
            }
        }

        lines
    }

    /// Flush a trailing unterminated line at EOF
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    strip_ansi(text.trim_end_matches('\r'))
}

/// Render a line through a one-row terminal and keep only its text.
///
/// Lines without an escape byte are returned untouched. Anything else goes
/// through `vt100`, so every sequence it understands (CSI, OSC ended by BEL or
/// ST, charset designations) is consumed rather than leaking into the text.
pub fn strip_ansi(text: &str) -> String {
    if !text.contains('\x1b') {
        return text.to_string();
    }

    let mut parser = vt100::Parser::new(1, render_width(text), 0);
    parser.process(text.as_bytes());
    parser.screen().contents()
}

/// Columns needed so the line never wraps: wide glyphs take two, tabs up to eight
fn render_width(text: &str) -> u16 {
    let cols: usize = text.chars().map(|c| if c == '\t' { 8 } else { 2 }).sum();
    cols.clamp(1, u16::MAX as usize) as u16
}
