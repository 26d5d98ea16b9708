//! Buffered connection: pooled read buffer, chunked write queue, idempotent close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tokio::sync::Notify;

use crate::buffer::ByteBuffer;
use crate::buffer_pool::BufferPool;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::PacketHeader;
use crate::session::ClientConnection;

use super::Service;
use super::processor::IoProcessor;

/// Traffic counters of one connection.
#[derive(Debug)]
pub struct ConnectionStats {
    created: Instant,
    net_in_bytes: AtomicU64,
    net_out_bytes: AtomicU64,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl ConnectionStats {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            net_in_bytes: AtomicU64::new(0),
            net_out_bytes: AtomicU64::new(0),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Bytes read.
    pub fn net_in_bytes(&self) -> u64 {
        self.net_in_bytes.load(Ordering::Relaxed)
    }

    /// Bytes written.
    pub fn net_out_bytes(&self) -> u64 {
        self.net_out_bytes.load(Ordering::Relaxed)
    }

    /// Time of the last read, relative to connection creation.
    pub fn last_read(&self) -> Duration {
        Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed))
    }

    /// Time of the last write, relative to connection creation.
    pub fn last_write(&self) -> Duration {
        Duration::from_millis(self.last_write_ms.load(Ordering::Relaxed))
    }
}

/// Read-side state, owned by the reader task.
#[derive(Debug)]
pub(crate) struct ReadState {
    pub(crate) buffer: ByteBuffer,
    last_large: Option<Instant>,
}

/// A non-blocking link with a pooled read buffer and an outbound write queue.
///
/// `write` never blocks: payloads are split into pooled chunks and queued for
/// the writer task. `close` is idempotent; only the first call deregisters the
/// connection and notifies the service, later calls just return queued buffers
/// to the pool.
pub struct Connection {
    id: u64,
    host: String,
    port: u16,
    processor: Arc<IoProcessor>,
    pool: Arc<BufferPool>,
    max_packet_size: usize,
    large_buffer_revert: Duration,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    write_queue: SegQueue<ByteBuffer>,
    pub(crate) write_ready: Notify,
    pub(crate) write_shutdown: Notify,
    pub(crate) read_shutdown: Notify,
    stats: ConnectionStats,
    service: Mutex<Option<Weak<dyn Service>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection registered with `processor`.
    ///
    /// The I/O tasks are started separately by [`spawn`](super::spawn).
    pub fn new(processor: &Arc<IoProcessor>, host: &str, port: u16, opts: &Opts) -> Arc<Self> {
        let conn = Arc::new(Self {
            id: processor.next_id(),
            host: host.to_string(),
            port,
            processor: Arc::clone(processor),
            pool: Arc::clone(processor.buffer_pool()),
            max_packet_size: opts.max_packet_size,
            large_buffer_revert: opts.large_buffer_revert,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            write_queue: SegQueue::new(),
            write_ready: Notify::new(),
            write_shutdown: Notify::new(),
            read_shutdown: Notify::new(),
            stats: ConnectionStats::new(),
            service: Mutex::new(None),
        });
        processor.register(&conn);
        conn
    }

    /// Connection id, unique within its processor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Peer port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Traffic counters.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Route incoming frames and the close event to `service`.
    pub fn set_service(&self, service: Weak<dyn Service>) {
        *self.service.lock().unwrap_or_else(PoisonError::into_inner) = Some(service);
    }

    fn service(&self) -> Option<Arc<dyn Service>> {
        self.service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reason given to the first `close` call.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get a buffer from the connection's pool.
    pub fn allocate(&self, size: usize) -> ByteBuffer {
        self.pool.allocate(size)
    }

    /// Return a buffer to the connection's pool.
    pub fn recycle(&self, buffer: ByteBuffer) {
        self.pool.recycle(buffer);
    }

    /// Queue `data` for sending.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionClosed` if the connection is closed.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        for chunk in data.chunks(self.pool.chunk_size().max(1)) {
            let mut buffer = self.pool.allocate_chunk();
            buffer.put(chunk);
            self.write_queue.push(buffer);
        }
        // close() may have drained the queue between the check and the push
        if self.is_closed() {
            self.drain_write_queue();
            return Err(self.closed_error());
        }
        self.write_ready.notify_one();
        Ok(())
    }

    fn closed_error(&self) -> Error {
        Error::ConnectionClosed(format!(
            "connection {} to {}:{} is closed",
            self.id, self.host, self.port
        ))
    }

    /// Number of chunks waiting to be written.
    pub fn pending_writes(&self) -> usize {
        self.write_queue.len()
    }

    pub(crate) fn pop_write(&self) -> Option<ByteBuffer> {
        self.write_queue.pop()
    }

    /// Close the connection.
    ///
    /// The first call records `reason`, deregisters from the processor, stops
    /// the I/O tasks and notifies the service. Every call returns queued
    /// buffers to the pool.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.cleanup();
            return;
        }
        *self.close_reason.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(reason.to_string());
        tracing::debug!(conn_id = self.id, host = %self.host, port = self.port, reason, "close connection");

        self.processor.remove_connection(self.id);
        self.read_shutdown.notify_one();
        self.write_shutdown.notify_one();
        self.write_ready.notify_one();
        self.cleanup();

        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .and_then(|weak| weak.upgrade());
        if let Some(service) = service {
            service.on_close(reason);
        }
    }

    fn cleanup(&self) {
        self.drain_write_queue();
    }

    fn drain_write_queue(&self) {
        while let Some(buffer) = self.write_queue.pop() {
            self.pool.recycle(buffer);
        }
    }

    pub(crate) fn new_read_state(&self) -> ReadState {
        ReadState {
            buffer: self.pool.allocate_chunk(),
            last_large: None,
        }
    }

    pub(crate) fn release_read_state(&self, state: ReadState) {
        self.pool.recycle(state.buffer);
    }

    pub(crate) fn record_read(&self, n: usize) {
        let n = n as u64;
        self.stats.net_in_bytes.fetch_add(n, Ordering::Relaxed);
        self.stats
            .last_read_ms
            .store(self.stats.elapsed_ms(), Ordering::Relaxed);
        self.processor.add_net_in_bytes(n);
    }

    pub(crate) fn record_write(&self, n: usize) {
        let n = n as u64;
        self.stats.net_out_bytes.fetch_add(n, Ordering::Relaxed);
        self.stats
            .last_write_ms
            .store(self.stats.elapsed_ms(), Ordering::Relaxed);
        self.processor.add_net_out_bytes(n);
    }

    /// Make sure the read buffer has free space for the next socket read.
    pub(crate) fn prepare_read(&self, state: &mut ReadState) {
        if state.buffer.remaining() == 0 {
            state.buffer.compact();
        }
        if state.buffer.remaining() == 0 {
            let needed = state.buffer.capacity() * 2;
            self.pool.ensure_capacity(&mut state.buffer, needed);
            state.last_large = Some(Instant::now());
        }
    }

    /// Hand every complete frame in the read buffer to the service.
    ///
    /// A partial frame that does not fit the buffer gets a larger buffer from
    /// the pool with the partial bytes copied forward; otherwise the buffer is
    /// compacted in place.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if a frame exceeds the maximum packet size.
    pub(crate) fn on_read_data(&self, state: &mut ReadState) -> Result<()> {
        let service = self.service();
        loop {
            let readable = state.buffer.readable();
            if readable.len() < PacketHeader::SIZE {
                break;
            }
            let header = PacketHeader::parse(readable)?;
            let frame_len = header.frame_length();
            if header.payload_length() > self.max_packet_size {
                return Err(Error::Protocol(format!(
                    "packet of {} bytes exceeds max_packet_size {}",
                    header.payload_length(),
                    self.max_packet_size
                )));
            }
            if readable.len() < frame_len {
                if state.buffer.capacity() < frame_len {
                    self.pool.ensure_capacity(&mut state.buffer, frame_len);
                    state.last_large = Some(Instant::now());
                } else if state.buffer.offset() + frame_len > state.buffer.capacity() {
                    state.buffer.compact();
                }
                return Ok(());
            }
            match &service {
                Some(service) => service.handle(&readable[..frame_len]),
                None => tracing::debug!(conn_id = self.id, len = frame_len, "no service, frame dropped"),
            }
            state.buffer.consume(frame_len);
        }
        if state.buffer.is_empty() {
            state.buffer.clear();
        }
        Ok(())
    }

    /// Fall back to a pooled chunk once an oversized buffer has gone unused
    /// for `large_buffer_revert`.
    pub(crate) fn read_reach_end(&self, state: &mut ReadState) {
        if state.buffer.is_pooled() || state.buffer.len() > self.pool.chunk_size() {
            return;
        }
        let expired = state
            .last_large
            .is_none_or(|at| at.elapsed() >= self.large_buffer_revert);
        if !expired {
            return;
        }
        let mut chunk = self.pool.allocate_chunk();
        chunk.put(state.buffer.readable());
        let large = std::mem::replace(&mut state.buffer, chunk);
        self.pool.recycle(large);
        state.last_large = None;
        tracing::debug!(conn_id = self.id, "reverted to pooled read buffer");
    }
}

impl ClientConnection for Connection {
    fn write(&self, packet: &[u8]) -> Result<()> {
        Connection::write(self, packet)
    }

    fn is_closed(&self) -> bool {
        Connection::is_closed(self)
    }
}
