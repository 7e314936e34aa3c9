use std::collections::VecDeque;
use std::io::{self, Write};

/// FIFO of outbound buffers written one head at a time.
///
/// A partially written head stays at the front with only its unsent
/// remainder left; it is popped once fully written.
#[derive(Debug, Default)]
pub struct WriteQueue {
    buffers: VecDeque<Vec<u8>>,
    /// Bytes of the head buffer already written.
    offset: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: Vec<u8>) {
        self.buffers.push_back(buffer);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of queued buffers, counting a partially written head.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Unsent bytes across all buffers.
    pub fn pending_bytes(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum::<usize>() - self.offset
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.offset = 0;
    }

    /// Write as much of the head buffer as `writer` accepts in one call.
    ///
    /// Returns the number of bytes accepted; zero means the queue is empty
    /// or the writer took nothing. `WouldBlock` and other errors are
    /// returned untouched and leave the queue as it was.
    pub fn write_head<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let Some(head) = self.buffers.front() else {
            return Ok(0);
        };
        let remaining = &head[self.offset..];
        let written = if remaining.is_empty() {
            0
        } else {
            writer.write(remaining)?
        };

        self.offset += written;
        if self.offset >= head.len() {
            self.buffers.pop_front();
            self.offset = 0;
        }
        Ok(written)
    }
}
