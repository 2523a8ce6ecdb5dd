//! Outbound chunk streams for one session.
//!
//! Stdout and stderr are write-through streams that wrap user bytes into
//! chunks of their tag, batched up to a block size. Both share a single
//! sink so chunks land on the wire whole and in program order. Exit is
//! never implied by closing a stream; it is signalled explicitly through
//! [`ChunkSink::write_exit`], after which the sink discards everything.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::protocol::{self, CHUNK_EXIT, OUTPUT_BLOCK_BYTES};

pub struct ChunkSink {
    writer: Box<dyn Write + Send>,
    closed: bool,
}

pub type SharedSink = Arc<Mutex<ChunkSink>>;

impl ChunkSink {
    pub fn shared(writer: Box<dyn Write + Send>) -> SharedSink {
        Arc::new(Mutex::new(Self {
            writer,
            closed: false,
        }))
    }

    fn write_chunk(&mut self, tag: u8, payload: &[u8]) -> io::Result<()> {
        if self.closed {
            // The exit chunk has been sent and the connection is logically
            // over; late writes from a lingering nail are dropped.
            return Ok(());
        }
        protocol::write_chunk(&mut self.writer, tag, payload)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.writer.flush()
    }

    /// Emits the exit chunk, flushes unconditionally, and closes the sink.
    pub fn write_exit(&mut self, status: i32) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let payload = protocol::exit_payload(status);
        let result = protocol::write_chunk(&mut self.writer, CHUNK_EXIT, &payload)
            .and_then(|()| self.writer.flush());
        self.closed = true;
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Cloneable handle to one outbound stream (stdout or stderr). Clones share
/// the batch buffer, so a nail and the session worker see the same stream.
#[derive(Clone)]
pub struct SessionOutput {
    sink: SharedSink,
    tag: u8,
    buffer: Arc<Mutex<Vec<u8>>>,
    block_bytes: usize,
}

impl SessionOutput {
    pub fn new(sink: SharedSink, tag: u8) -> Self {
        Self::with_block_size(sink, tag, OUTPUT_BLOCK_BYTES)
    }

    pub fn with_block_size(sink: SharedSink, tag: u8, block_bytes: usize) -> Self {
        Self {
            sink,
            tag,
            buffer: Arc::new(Mutex::new(Vec::new())),
            block_bytes: block_bytes.max(1),
        }
    }

    fn drain_full_blocks(&self, buffer: &mut Vec<u8>) -> io::Result<()> {
        while buffer.len() >= self.block_bytes {
            let rest = buffer.split_off(self.block_bytes);
            let block = std::mem::replace(buffer, rest);
            self.sink.lock().unwrap().write_chunk(self.tag, &block)?;
        }
        Ok(())
    }
}

impl Write for SessionOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend_from_slice(data);
        self.drain_full_blocks(&mut buffer)?;
        Ok(data.len())
    }

    /// Emits any partial block as a chunk and flushes the transport.
    fn flush(&mut self) -> io::Result<()> {
        let mut buffer = self.buffer.lock().unwrap();
        if !buffer.is_empty() {
            let block = std::mem::take(&mut *buffer);
            self.sink.lock().unwrap().write_chunk(self.tag, &block)?;
        }
        self.sink.lock().unwrap().flush()
    }
}
