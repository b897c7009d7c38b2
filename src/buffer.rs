//! Receive buffer with line extraction

use crate::constants::{BUF_CHUNK, MAX_BUFFER_SIZE};
use crate::error::{AmiError, AmiResult};

/// Growable byte buffer with a read cursor.
///
/// Consumed bytes stay in place until [`compact`](Self::compact) moves the
/// unread tail to the front, so line extraction never shifts memory per line.
#[derive(Debug)]
pub(crate) struct FrameBuffer {
    data: Vec<u8>,
    position: usize,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK),
            position: 0,
        }
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.data.capacity() - self.data.len() < bytes.len() {
            self.data
                .reserve(bytes.len().max(BUF_CHUNK));
        }
        self.data
            .extend_from_slice(bytes);
    }

    /// Unread byte count.
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            return Err(AmiError::protocol_error(format!(
                "receive buffer holds {} unterminated bytes (limit {})",
                self.len(),
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Take the next `\n`-terminated line, without the terminator and any
    /// trailing `\r`. Returns `None` when no complete line is buffered.
    pub(crate) fn take_line(&mut self) -> Option<&[u8]> {
        let unread = &self.data[self.position..];
        let newline = unread
            .iter()
            .position(|b| *b == b'\n')?;
        let start = self.position;
        self.position += newline + 1;

        let mut end = start + newline;
        if end > start && self.data[end - 1] == b'\r' {
            end -= 1;
        }
        Some(&self.data[start..end])
    }

    /// Drop consumed bytes.
    pub(crate) fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        if self.position == self.data.len() {
            self.data
                .clear();
        } else {
            self.data
                .drain(..self.position);
        }
        self.position = 0;
    }
}
