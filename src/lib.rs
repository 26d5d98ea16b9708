//! Distributed transaction coordination for a MySQL sharding proxy.
//!
//! # Features
//!
//! - **Cohort aggregation**: N independent backend replies become one decision
//! - **XA two-phase commit**: `XA END` → `XA PREPARE` → `XA COMMIT`/`XA ROLLBACK`
//! - **Sans-I/O state machines**: stage and cohort logic is separated from I/O
//! - **Pooled, non-blocking I/O**: chunked write queues and pooled read buffers on tokio
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use zero_shard::backend::BackendService;
//! use zero_shard::net::IoProcessor;
//! use zero_shard::session::{ClientConnection, ShardSession};
//! use zero_shard::{Opts, begin_transaction_commit};
//!
//! async fn commit(client: Arc<dyn ClientConnection>) -> zero_shard::Result<()> {
//!     let opts: Opts = "mysql://root@10.0.0.1:3306/db1".try_into()?;
//!     let processor = IoProcessor::new("backend", Arc::clone(&opts.buffer_pool));
//!
//!     let session = ShardSession::new(1, client, &opts.xa_id_prefix);
//!     let (dn1, _tasks) = BackendService::connect("dn1".into(), &opts, &processor).await?;
//!     session.attach(dn1);
//!     session.set_xa(true);
//!
//!     // OK or ERR is written to the client once every shard has answered
//!     begin_transaction_commit(session.as_ref())?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod buffer;
pub mod buffer_pool;
pub mod coordinator;
pub mod error;
pub mod handler;
#[cfg(feature = "tokio")]
pub mod net;
pub mod opts;
pub mod participant;
pub mod protocol;
pub mod session;
pub mod state;

pub use backend::Backend;
pub use coordinator::{
    Coordinator, begin_transaction_commit, begin_transaction_rollback,
    interrupt_current_transaction,
};
pub use error::{Error, Result, ServerError};
pub use handler::ResponseHandler;
pub use opts::{Opts, SocketOpts};
pub use participant::{BackendInfo, ParticipantId};
pub use session::{ClientConnection, Session, ShardSession};
pub use state::{Conclusion, Intent, Stage};
