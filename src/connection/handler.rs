//! Connection Handler
//!
//! Drives one client: an incremental read loop that accumulates bytes in
//! a `BytesMut`, parses complete commands out of it, executes them and
//! writes the serialized replies back through a buffered stream. TCP is a
//! byte stream, so a single read may carry half a command or several
//! pipelined ones; the parser's consumed-byte contract handles both.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::commands::CommandHandler;
use crate::protocol::{parse, ParseError, RespValue};

/// Incoming data per connection is capped at 64 KB.
const MAX_BUFFER_SIZE: usize = 64 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Fixed bookkeeping cost attributed to each connected client.
const CLIENT_FIXED_OVERHEAD: usize = 512;

/// What role a connection plays. Replica links get separate treatment in
/// the memory report because their buffers grow for different reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Normal,
    Replica,
}

#[derive(Debug)]
struct ClientRecord {
    kind: ClientKind,
    query_buf: usize,
    output_buf: usize,
}

/// Live connections and their buffer footprints.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, ClientRecord>>,
    next_id: AtomicU64,
    commands_processed: AtomicU64,
}

/// Aggregated buffer usage, grouped the way the overhead report wants it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientBufferTotals {
    pub normal_bytes: usize,
    pub normal_count: usize,
    pub replica_bytes: usize,
    pub replica_count: usize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection; the returned id keys later buffer updates.
    pub fn register(&self, kind: ClientKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().unwrap().insert(
            id,
            ClientRecord {
                kind,
                query_buf: 0,
                output_buf: 0,
            },
        );
        id
    }

    pub fn unregister(&self, id: u64) {
        self.clients.write().unwrap().remove(&id);
    }

    /// Publishes a connection's current buffer sizes.
    pub fn update_buffers(&self, id: u64, query_buf: usize, output_buf: usize) {
        if let Some(rec) = self.clients.write().unwrap().get_mut(&id) {
            rec.query_buf = query_buf;
            rec.output_buf = output_buf;
        }
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Sums buffer bytes per client role, including the fixed per-client
    /// bookkeeping cost.
    pub fn buffer_totals(&self) -> ClientBufferTotals {
        let clients = self.clients.read().unwrap();
        let mut totals = ClientBufferTotals::default();
        for rec in clients.values() {
            let bytes = rec.query_buf + rec.output_buf + CLIENT_FIXED_OVERHEAD;
            match rec.kind {
                ClientKind::Normal => {
                    totals.normal_bytes += bytes;
                    totals.normal_count += 1;
                }
                ClientKind::Replica => {
                    totals.replica_bytes += bytes;
                    totals.replica_count += 1;
                }
            }
        }
        totals
    }
}

/// Errors ending a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("client disconnected")]
    Disconnected,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("input buffer limit exceeded")]
    BufferFull,
}

/// State of one client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    commands: CommandHandler,
    registry: Arc<ClientRegistry>,
    client_id: u64,
    out_bytes: usize,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        commands: CommandHandler,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        let client_id = registry.register(ClientKind::Normal);
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            commands,
            registry,
            client_id,
            out_bytes: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");
        let result = self.serve().await;
        match &result {
            Ok(()) | Err(ConnectionError::Disconnected) => {
                debug!(client = %self.addr, "client disconnected")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }
        self.registry.unregister(self.client_id);
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some((command, consumed)) = parse(&self.buffer)? {
                let _ = self.buffer.split_to(consumed);
                let quit = is_quit(&command);
                let reply = self.commands.execute(command);
                self.registry.command_processed();
                self.write_reply(&reply).await?;
                self.registry
                    .update_buffers(self.client_id, self.buffer.capacity(), self.out_bytes);
                if quit {
                    return Ok(());
                }
            }
            self.fill_buffer().await?;
        }
    }

    async fn fill_buffer(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            return Err(ConnectionError::BufferFull);
        }
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }
        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::Disconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }
        Ok(())
    }

    async fn write_reply(&mut self, reply: &RespValue) -> Result<(), ConnectionError> {
        let bytes = reply.serialize();
        self.out_bytes = bytes.len();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn is_quit(command: &RespValue) -> bool {
    if let RespValue::Array(parts) = command {
        if let Some(name) = parts.first().and_then(|p| p.as_str()) {
            return name.eq_ignore_ascii_case("quit");
        }
    }
    false
}

/// Accepts ownership of a fresh connection and serves it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    commands: CommandHandler,
    registry: Arc<ClientRegistry>,
) {
    let handler = ConnectionHandler::new(stream, addr, commands, registry);
    let _ = handler.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ServerContext;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_server() -> (SocketAddr, Arc<ServerContext>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = Arc::new(ServerContext::new(16));
        let accept_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let commands = CommandHandler::new(Arc::clone(&accept_ctx));
                let registry = Arc::clone(&accept_ctx.clients);
                tokio::spawn(handle_connection(stream, client_addr, commands, registry));
            }
        });
        (addr, ctx)
    }

    #[tokio::test]
    async fn test_ping() {
        let (addr, _ctx) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_set_then_object_encoding() {
        let (addr, _ctx) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\n42\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        client
            .write_all(b"*3\r\n$6\r\nOBJECT\r\n$8\r\nENCODING\r\n$1\r\nk\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$3\r\nint\r\n");
    }

    #[tokio::test]
    async fn test_registry_tracks_connections() {
        let (addr, ctx) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let _ = client.read(&mut buf).await.unwrap();
        assert_eq!(ctx.clients.connection_count(), 1);
        assert!(ctx.clients.commands_processed() >= 1);
        let totals = ctx.clients.buffer_totals();
        assert_eq!(totals.normal_count, 1);
        assert!(totals.normal_bytes >= CLIENT_FIXED_OVERHEAD);

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(ctx.clients.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let (addr, _ctx) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nQUIT\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
