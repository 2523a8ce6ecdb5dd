//! The framed chunk protocol shared with nailgun clients.
//!
//! Every frame on the wire is a chunk: a 32-bit big-endian payload length,
//! a one-byte type tag, then exactly that many payload bytes. Chunks are
//! concatenated on the stream with no further framing.

use std::io::{self, Read, Write};

use crate::error::SessionError;

// Client-to-server chunk tags. Everything up to and including the first
// `CHUNK_COMMAND` forms the session header; after that only stdin
// multiplexing tags are expected from the client.
pub const CHUNK_ARGUMENT: u8 = b'A';
pub const CHUNK_ENVIRONMENT: u8 = b'E';
pub const CHUNK_WORKING_DIR: u8 = b'D';
pub const CHUNK_COMMAND: u8 = b'C';
pub const CHUNK_STDIN: u8 = b'0';
pub const CHUNK_STDIN_EOF: u8 = b'.';
pub const CHUNK_HEARTBEAT: u8 = b'H';

// Server-to-client chunk tags. `CHUNK_EXIT` is always the last chunk of a
// session.
pub const CHUNK_STDOUT: u8 = b'1';
pub const CHUNK_STDERR: u8 = b'2';
pub const CHUNK_EXIT: u8 = b'X';

/// Exit status reported when a nail fails with an error or panics.
pub const EXIT_EXCEPTION: i32 = 899;
/// Exit status reported when no nail resolves for the requested command.
pub const EXIT_NO_SUCH_COMMAND: i32 = 898;

/// Largest accepted payload for a single header chunk.
pub const MAX_HEADER_CHUNK_BYTES: usize = 64 * 1024;
/// Largest accepted payload for a single stdin chunk.
pub const MAX_STDIN_CHUNK_BYTES: usize = 2 * 1024 * 1024;
/// Cumulative cap on header payload bytes before the command chunk arrives.
pub const MAX_HEADER_TOTAL_BYTES: usize = 1024 * 1024;
/// Outbound chunks are batched up to this many payload bytes.
pub const OUTPUT_BLOCK_BYTES: usize = 64 * 1024;

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Header payloads are textual; stdio payloads stay raw bytes.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

pub fn tag_name(tag: u8) -> &'static str {
    match tag {
        CHUNK_ARGUMENT => "argument",
        CHUNK_ENVIRONMENT => "environment",
        CHUNK_WORKING_DIR => "working-directory",
        CHUNK_COMMAND => "command",
        CHUNK_STDIN => "stdin",
        CHUNK_STDIN_EOF => "stdin-eof",
        CHUNK_HEARTBEAT => "heartbeat",
        CHUNK_STDOUT => "stdout",
        CHUNK_STDERR => "stderr",
        CHUNK_EXIT => "exit",
        _ => "unknown",
    }
}

/// Reads one chunk. A short read anywhere inside the frame is fatal to the
/// session; a payload larger than `max_payload` is a protocol error and the
/// payload is left unread.
pub fn read_chunk<R: Read>(reader: &mut R, max_payload: usize) -> Result<Chunk, SessionError> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head)?;
    let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let tag = head[4];
    if len > i32::MAX as u32 {
        return Err(SessionError::Protocol(format!(
            "chunk length {len} is not representable"
        )));
    }
    let len = len as usize;
    if len > max_payload {
        return Err(SessionError::Oversize {
            tag,
            len,
            max: max_payload,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Chunk { tag, payload })
}

/// Writes one chunk. Does not flush; callers decide when the transport
/// should be flushed (the exit chunk always is).
pub fn write_chunk<W: Write>(writer: &mut W, tag: u8, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk payload too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&[tag])?;
    writer.write_all(payload)
}

/// Renders the payload of an exit chunk: ASCII decimal status plus newline.
pub fn exit_payload(status: i32) -> Vec<u8> {
    format!("{status}\n").into_bytes()
}
