//! Readiness-driven reader and writer tasks.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, lookup_host};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::opts::Opts;

use super::connection::Connection;
use super::processor::IoProcessor;

/// Handles of a connection's I/O tasks.
#[derive(Debug)]
pub struct IoTasks {
    /// Reader task: fills the read buffer and dispatches frames
    pub reader: JoinHandle<()>,
    /// Writer task: drains the write queue
    pub writer: JoinHandle<()>,
}

impl IoTasks {
    /// Wait for both tasks to finish.
    ///
    /// A task that panicked or was cancelled is logged, not propagated.
    pub async fn join(self) {
        if let Err(e) = self.reader.await {
            tracing::warn!(error = %e, "reader task failed");
        }
        if let Err(e) = self.writer.await {
            tracing::warn!(error = %e, "writer task failed");
        }
    }
}

/// Drive `conn` over `stream`.
///
/// Each task exits when the connection closes; the reader closes it on EOF or
/// a read error, the writer on a write error.
pub fn spawn<S>(conn: Arc<Connection>, stream: S) -> IoTasks
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = tokio::spawn(read_loop(Arc::clone(&conn), read_half));
    let writer = tokio::spawn(write_loop(conn, write_half));
    IoTasks { reader, writer }
}

async fn read_loop<R>(conn: Arc<Connection>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut state = conn.new_read_state();
    while !conn.is_closed() {
        conn.prepare_read(&mut state);
        let result = tokio::select! {
            result = reader.read(state.buffer.spare_mut()) => Some(result),
            () = conn.read_shutdown.notified() => None,
        };
        let Some(result) = result else {
            break;
        };
        match result {
            Ok(0) => {
                conn.close("stream closed");
                break;
            }
            Ok(n) => {
                state.buffer.advance(n);
                conn.record_read(n);
                if let Err(e) = conn.on_read_data(&mut state) {
                    tracing::warn!(conn_id = conn.id(), error = %e, "malformed data from peer");
                    conn.close(&e.to_string());
                    break;
                }
                conn.read_reach_end(&mut state);
            }
            Err(e) => {
                conn.close(&format!("read error: {e}"));
                break;
            }
        }
    }
    conn.release_read_state(state);
}

async fn write_loop<W>(conn: Arc<Connection>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    'outer: loop {
        while let Some(buffer) = conn.pop_write() {
            let result = tokio::select! {
                result = writer.write_all(buffer.readable()) => Some(result),
                () = conn.write_shutdown.notified() => None,
            };
            let n = buffer.len();
            conn.recycle(buffer);
            match result {
                Some(Ok(())) => conn.record_write(n),
                Some(Err(e)) => {
                    conn.close(&format!("write error: {e}"));
                    break 'outer;
                }
                None => break 'outer,
            }
        }
        if let Err(e) = writer.flush().await {
            conn.close(&format!("write error: {e}"));
            break;
        }
        if conn.is_closed() {
            break;
        }
        conn.write_ready.notified().await;
    }
    // buffers queued after the last drain
    conn.close("writer stopped");
    let _ = writer.shutdown().await;
}

/// Open a TCP link to `opts.host:opts.port` and start its I/O tasks.
///
/// Socket options from [`Opts::socket`] are applied before connecting.
pub async fn connect(
    opts: &Opts,
    processor: &Arc<IoProcessor>,
) -> Result<(Arc<Connection>, IoTasks)> {
    if opts.host.is_empty() {
        return Err(Error::InvalidUsage("host is empty".into()));
    }
    let addr = lookup_host((opts.host.as_str(), opts.port))
        .await?
        .next()
        .ok_or_else(|| Error::InvalidUsage(format!("cannot resolve {}", opts.host)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.set_recv_buffer_size(opts.socket.so_rcvbuf)?;
    socket.set_send_buffer_size(opts.socket.so_sndbuf)?;

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(opts.socket.tcp_nodelay)?;
    tracing::debug!(host = %opts.host, port = opts.port, "backend connected");

    let conn = Connection::new(processor, &opts.host, opts.port, opts);
    let tasks = spawn(Arc::clone(&conn), stream);
    Ok((conn, tasks))
}
