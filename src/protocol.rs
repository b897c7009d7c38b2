//! AMI frame codec: incremental decoding and wire encoding

use crate::{
    buffer::FrameBuffer,
    constants::{LINE_TERMINATOR, MAX_FRAME_SIZE},
    error::{AmiError, AmiResult},
    frame::Frame,
};
use tracing::{trace, warn};

/// Incremental AMI frame decoder.
///
/// Bytes are pushed with [`add_data`](Self::add_data) as they arrive from the
/// socket; complete frames are pulled with [`next_frame`](Self::next_frame) or
/// the lazy [`frames`](Self::frames) iterator. A frame split across reads is
/// carried over and resumed on the next chunk.
///
/// ```
/// use asterisk_ami_tokio::FrameParser;
///
/// let mut parser = FrameParser::new();
/// parser.add_data(b"Response: Success\r\nActionID: 1\r\n").unwrap();
/// assert!(parser.next_frame().is_none());
/// parser.add_data(b"Ping: Pong\r\n\r\n").unwrap();
/// let frame = parser.next_frame().unwrap();
/// assert_eq!(frame.get("ping"), Some("Pong"));
/// ```
#[derive(Debug)]
pub struct FrameParser {
    buffer: FrameBuffer,
    partial: Frame,
    partial_size: usize,
    discarding: bool,
}

impl FrameParser {
    /// Create new parser
    pub fn new() -> Self {
        Self {
            buffer: FrameBuffer::new(),
            partial: Frame::new(),
            partial_size: 0,
            discarding: false,
        }
    }

    /// Add data to the parser buffer.
    ///
    /// Fails only when the buffer holds more unterminated data than any
    /// legitimate exchange produces, which means the stream is desynchronized.
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Consume the one-line banner the exchange sends on connect
    /// (`Asterisk Call Manager/<version>`).
    pub fn take_greeting(&mut self) -> Option<String> {
        let line = self
            .buffer
            .take_line()
            .map(|l| {
                String::from_utf8_lossy(l)
                    .trim()
                    .to_string()
            });
        self.buffer
            .compact();
        line
    }

    /// Try to decode one complete frame from buffered data.
    ///
    /// Lines without a `:` separator are dropped with a warning; frames over
    /// [`MAX_FRAME_SIZE`] are discarded whole. Neither is fatal.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let frame = self.scan();
        self.buffer
            .compact();
        frame
    }

    fn scan(&mut self) -> Option<Frame> {
        while let Some(line) = self
            .buffer
            .take_line()
        {
            if line.is_empty() {
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                if self
                    .partial
                    .is_empty()
                {
                    continue;
                }
                self.partial_size = 0;
                let frame = std::mem::take(&mut self.partial);
                trace!("[RECV] Decoded frame with {} fields", frame.len());
                return Some(frame);
            }

            if self.discarding {
                continue;
            }

            self.partial_size += line.len();
            if self.partial_size > MAX_FRAME_SIZE {
                warn!(
                    "Dropping frame exceeding {} bytes ({} fields buffered)",
                    MAX_FRAME_SIZE,
                    self.partial.len()
                );
                self.partial = Frame::new();
                self.partial_size = 0;
                self.discarding = true;
                continue;
            }

            let line = String::from_utf8_lossy(line);
            match line.split_once(':') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        warn!("Dropping line with empty key: {:?}", line);
                        continue;
                    }
                    self.partial
                        .push(key, value.trim());
                }
                None => warn!("Dropping malformed line without separator: {:?}", line),
            }
        }
        None
    }

    /// Lazily decode every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { parser: self }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FrameParser::frames`].
#[derive(Debug)]
pub struct Frames<'a> {
    parser: &'a mut FrameParser,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.parser
            .next_frame()
    }
}

/// Render a frame for the wire: fields in insertion order, one `Key: Value`
/// per line, `\r\n` terminated, followed by a blank line.
pub fn encode(frame: &Frame) -> String {
    let mut out = String::with_capacity(
        frame
            .iter()
            .map(|(k, v)| k.len() + v.len() + 4)
            .sum::<usize>()
            + 2,
    );
    for (key, value) in frame.iter() {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push_str(LINE_TERMINATOR);
    }
    out.push_str(LINE_TERMINATOR);
    out
}

/// Reject text that would break line framing.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}
