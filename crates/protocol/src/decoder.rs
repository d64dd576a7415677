use bytes::BytesMut;
use snafu::ResultExt;

use crate::error::{LineEncodingSnafu, ProtocolResult};

/// Stateful byte-to-line decoder for the streamed response body.
///
/// Bytes are buffered until a `\n` terminator arrives, so a line split across
/// chunk boundaries, including a multi-byte UTF-8 sequence split mid-codepoint,
/// is reassembled before decoding. UTF-8 validation runs per completed line
/// only, which is what makes mid-codepoint chunk splits harmless.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one byte chunk and returns every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> ProtocolResult<Vec<String>> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline_index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.split_to(newline_index + 1);
            lines.push(decode_line(&line[..newline_index])?);
        }

        Ok(lines)
    }

    /// Emits the final newline-less line at end-of-stream, if any.
    ///
    /// A done frame may legitimately be the last line of the body without a
    /// trailing terminator, so callers must drain this before dropping the
    /// stream.
    pub fn finish(&mut self) -> ProtocolResult<Option<String>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let line = self.buffer.split();
        decode_line(&line).map(Some)
    }
}

fn decode_line(raw: &[u8]) -> ProtocolResult<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = std::str::from_utf8(raw).context(LineEncodingSnafu {
        stage: "decode-line",
    })?;
    Ok(text.to_string())
}
