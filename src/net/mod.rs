//! Buffered, non-blocking connection substrate on tokio.
//!
//! A [`Connection`] owns a FIFO write queue of pooled chunks and, through its
//! reader task, a pooled read buffer. Complete packet frames are handed to the
//! connection's [`Service`]. Connections are registered with the
//! [`IoProcessor`] that created them and deregistered exactly once on close.

mod connection;
mod processor;
mod socket;

pub use connection::{Connection, ConnectionStats};
pub use processor::IoProcessor;
pub use socket::{IoTasks, connect, spawn};

/// Protocol layer sitting on top of a [`Connection`].
pub trait Service: Send + Sync {
    /// Called for each complete frame (header + payload), in arrival order.
    fn handle(&self, frame: &[u8]);

    /// Called once when the connection closes.
    fn on_close(&self, reason: &str);
}
