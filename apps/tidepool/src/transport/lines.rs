use tracing::warn;

/// Splits a streamed response body into newline-delimited records.
///
/// Body chunks may end mid-record (or mid UTF-8 sequence); the tail is kept
/// until the next chunk completes it. The signaling service opens every
/// stream with a padding line, which is skipped.
#[derive(Debug)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    preamble_skipped: bool,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            preamble_skipped: false,
        }
    }

    /// Decoder for bodies that carry no padding preamble.
    pub fn without_preamble() -> Self {
        Self {
            pending: Vec::new(),
            preamble_skipped: true,
        }
    }

    /// Feed the next body chunk and collect every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !self.preamble_skipped {
                self.preamble_skipped = true;
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match String::from_utf8(line) {
                Ok(text) => records.push(text),
                Err(err) => {
                    warn!(
                        target = "tidepool::transport",
                        error = %err,
                        "dropping non utf-8 stream record"
                    );
                }
            }
        }
        records
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}
