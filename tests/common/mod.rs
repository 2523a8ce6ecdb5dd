#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use nailgund::protocol::{
    CHUNK_ARGUMENT, CHUNK_COMMAND, CHUNK_ENVIRONMENT, CHUNK_EXIT, CHUNK_HEARTBEAT, CHUNK_STDERR,
    CHUNK_STDIN, CHUNK_STDIN_EOF, CHUNK_STDOUT, CHUNK_WORKING_DIR, MAX_STDIN_CHUNK_BYTES,
    read_chunk, write_chunk,
};
use nailgund::{Server, ServerConfig};

pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts a server on an ephemeral loopback port.
pub fn start_server(mut config: ServerConfig) -> (Server, SocketAddr) {
    config.bind = SocketAddr::from(([127, 0, 0, 1], 0));
    let server = Server::new(config);
    let addr = server.start().expect("start server");
    (server, addr)
}

/// A thin test client speaking the chunk protocol over TCP.
pub struct NgClient {
    stream: TcpStream,
}

/// Everything the server sent back, split by stream.
#[derive(Debug)]
pub struct SessionReply {
    pub chunks: Vec<(u8, Vec<u8>)>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: Option<i32>,
}

impl NgClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to server");
        stream
            .set_read_timeout(Some(CLIENT_READ_TIMEOUT))
            .expect("set read timeout");
        Self { stream }
    }

    fn send(&mut self, tag: u8, payload: &[u8]) {
        write_chunk(&mut self.stream, tag, payload).expect("send chunk");
        self.stream.flush().expect("flush chunk");
    }

    pub fn arg(&mut self, value: &str) -> &mut Self {
        self.send(CHUNK_ARGUMENT, value.as_bytes());
        self
    }

    pub fn env(&mut self, pair: &str) -> &mut Self {
        self.send(CHUNK_ENVIRONMENT, pair.as_bytes());
        self
    }

    pub fn dir(&mut self, path: &str) -> &mut Self {
        self.send(CHUNK_WORKING_DIR, path.as_bytes());
        self
    }

    pub fn command(&mut self, name: &str) -> &mut Self {
        self.send(CHUNK_COMMAND, name.as_bytes());
        self
    }

    pub fn stdin(&mut self, bytes: &[u8]) -> &mut Self {
        self.send(CHUNK_STDIN, bytes);
        self
    }

    pub fn stdin_eof(&mut self) -> &mut Self {
        self.send(CHUNK_STDIN_EOF, b"");
        self
    }

    pub fn heartbeat(&mut self) -> &mut Self {
        self.send(CHUNK_HEARTBEAT, b"");
        self
    }

    /// Reads server chunks until the exit chunk or end-of-stream, then
    /// verifies nothing follows the exit chunk.
    pub fn finish(mut self) -> SessionReply {
        let mut reply = SessionReply {
            chunks: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: None,
        };
        loop {
            let chunk = match read_chunk(&mut self.stream, MAX_STDIN_CHUNK_BYTES) {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            match chunk.tag {
                CHUNK_STDOUT => reply.stdout.extend_from_slice(&chunk.payload),
                CHUNK_STDERR => reply.stderr.extend_from_slice(&chunk.payload),
                CHUNK_EXIT => {
                    let text = String::from_utf8_lossy(&chunk.payload);
                    reply.exit = Some(
                        text.trim()
                            .parse()
                            .unwrap_or_else(|_| panic!("non-decimal exit payload: {text:?}")),
                    );
                    reply.chunks.push((chunk.tag, chunk.payload));
                    let mut trailing = [0u8; 1];
                    match self.stream.read(&mut trailing) {
                        Ok(0) => {}
                        Ok(_) => panic!("server sent bytes after the exit chunk"),
                        // A reset when the server slams the socket shut is
                        // also a clean end of session.
                        Err(_) => {}
                    }
                    return reply;
                }
                other => panic!("unexpected server chunk tag {:?}", other as char),
            }
            reply.chunks.push((chunk.tag, chunk.payload));
        }
        reply
    }
}

/// Drives one complete scripted session and returns the reply.
pub fn run_session(
    addr: SocketAddr,
    script: impl FnOnce(&mut NgClient),
) -> SessionReply {
    let mut client = NgClient::connect(addr);
    script(&mut client);
    client.finish()
}

/// Polls until the server reports no running nails.
pub fn wait_for_idle_nails(server: &Server, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if server.active_nails().is_empty() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    server.active_nails().is_empty()
}
