//! Stream decoder: turns the agent's NDJSON byte stream into structured messages.
//!
//! Each line is decoded on its own. Garbage, partial JSON and oversized lines
//! are logged and skipped; only the end of the underlying stream ends decoding.

use futures_util::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use tc_types::message::StructuredMessage;

/// Initial read buffer.
pub const INITIAL_BUFFER: usize = 64 * 1024;

/// Longest accepted line. Longer lines are dropped, not fatal.
pub const MAX_LINE: usize = 1024 * 1024;

enum LineError {
    TooLong(usize),
    Io(std::io::Error),
}

pub struct StreamDecoder<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    max_line: usize,
    line_no: u64,
}

impl<R: AsyncRead + Unpin> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line(reader, MAX_LINE)
    }

    pub fn with_max_line(reader: R, max_line: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(INITIAL_BUFFER, reader),
            line: Vec::new(),
            max_line,
            line_no: 0,
        }
    }

    /// The next decodable message, or `None` once the stream has ended.
    pub async fn next_message(&mut self) -> Option<StructuredMessage> {
        loop {
            match self.next_line().await {
                Ok(Some(line)) => {
                    self.line_no += 1;
                    if line.trim_ascii().is_empty() {
                        continue;
                    }
                    match StructuredMessage::from_line(&line) {
                        Ok(msg) => return Some(msg),
                        Err(e) => {
                            warn!("Skipping undecodable line {}: {e}", self.line_no);
                        }
                    }
                }
                Ok(None) => return None,
                Err(LineError::TooLong(len)) => {
                    self.line_no += 1;
                    warn!(
                        "Skipping line {}: {len} bytes exceeds the {} byte limit",
                        self.line_no, self.max_line
                    );
                }
                Err(LineError::Io(e)) => {
                    // A pseudo-terminal reports EIO once the child side is gone.
                    debug!("Output stream ended: {e}");
                    return None;
                }
            }
        }
    }

    /// Consume the decoder as an ordered stream of messages.
    pub fn into_stream(self) -> impl Stream<Item = StructuredMessage>
    where
        R: 'static,
    {
        futures_util::stream::unfold(self, |mut decoder| async move {
            decoder.next_message().await.map(|msg| (msg, decoder))
        })
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, LineError> {
        self.line.clear();
        let mut seen = 0usize;
        let mut overflow = false;

        loop {
            let (used, done) = {
                let available = self.reader.fill_buf().await.map_err(LineError::Io)?;
                if available.is_empty() {
                    // End of stream: flush an unterminated final line.
                    if overflow {
                        return Err(LineError::TooLong(seen));
                    }
                    if seen == 0 {
                        return Ok(None);
                    }
                    return Ok(Some(std::mem::take(&mut self.line)));
                }

                let newline = available.iter().position(|&b| b == b'\n');
                let chunk = match newline {
                    Some(i) => &available[..i],
                    None => available,
                };
                seen += chunk.len();
                if !overflow {
                    if self.line.len() + chunk.len() > self.max_line {
                        overflow = true;
                        self.line = Vec::new();
                    } else {
                        self.line.extend_from_slice(chunk);
                    }
                }
                match newline {
                    Some(i) => (i + 1, true),
                    None => (available.len(), false),
                }
            };
            self.reader.consume(used);

            if done {
                if overflow {
                    return Err(LineError::TooLong(seen));
                }
                return Ok(Some(std::mem::take(&mut self.line)));
            }
        }
    }
}
