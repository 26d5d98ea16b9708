//! Backend link over a buffered connection.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::Result;
use crate::handler::ResponseHandler;
use crate::net::{Connection, IoProcessor, IoTasks, Service, connect};
use crate::opts::Opts;
use crate::participant::{BackendInfo, ParticipantId};
use crate::protocol::{Command, RawPacket};
use crate::state::{ReplyEvent, ReplyStateMachine};

use super::Backend;

/// Protocol façade over one [`Connection`].
///
/// Sends transaction control commands and turns the backend's reply packets
/// into [`ResponseHandler`] callbacks.
pub struct BackendService {
    id: ParticipantId,
    info: BackendInfo,
    conn: Arc<Connection>,
    reply: Mutex<ReplyStateMachine>,
    handler: Mutex<Option<Weak<dyn ResponseHandler>>>,
}

impl std::fmt::Debug for BackendService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendService")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl BackendService {
    /// Wrap an established connection and take over its incoming frames.
    pub fn new(id: ParticipantId, info: BackendInfo, conn: Arc<Connection>) -> Arc<Self> {
        let service = Arc::new(Self {
            id,
            info,
            conn,
            reply: Mutex::new(ReplyStateMachine::new()),
            handler: Mutex::new(None),
        });
        let weak: Weak<dyn Service> = Arc::downgrade(&service) as Weak<dyn Service>;
        service.conn.set_service(weak);
        service
    }

    /// Connect to the backend described by `opts` as participant `id`.
    pub async fn connect(
        id: ParticipantId,
        opts: &Opts,
        processor: &Arc<IoProcessor>,
    ) -> Result<(Arc<Self>, IoTasks)> {
        let (conn, tasks) = connect(opts, processor).await?;
        let info = BackendInfo {
            host: opts.host.clone(),
            port: opts.port,
            schema: opts.schema.clone(),
            thread_id: 0,
        };
        Ok((Self::new(id, info, conn), tasks))
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Close the link.
    pub fn close(&self, reason: &str) {
        self.conn.close(reason);
    }

    fn handler(&self) -> Option<Arc<dyn ResponseHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn classify(&self, packet: &RawPacket<'_>) -> Result<ReplyEvent> {
        self.reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .step(packet)
    }
}

impl Backend for BackendService {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    fn info(&self) -> BackendInfo {
        self.info.clone()
    }

    fn send_command(&self, command: &Command) -> Result<()> {
        tracing::debug!(participant = %self.id, conn_id = self.conn.id(), sql = command.sql(), "send command");
        let mut buf = Vec::with_capacity(command.sql().len() + 5);
        command.write(&mut buf);
        self.conn.write(&buf)
    }

    fn set_response_handler(&self, handler: Weak<dyn ResponseHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

impl Service for BackendService {
    fn handle(&self, frame: &[u8]) {
        let event = RawPacket::parse(frame).and_then(|packet| self.classify(&packet));
        let Some(handler) = self.handler() else {
            tracing::debug!(participant = %self.id, "no response handler, reply dropped");
            return;
        };
        match event {
            Ok(ReplyEvent::Ok) => handler.ok_response(self, frame),
            Ok(ReplyEvent::Error(err)) => handler.error_response(self, err),
            Ok(ReplyEvent::ResultSetStart { .. } | ReplyEvent::Field) => {}
            Ok(ReplyEvent::FieldEof) => handler.field_eof_response(self, frame),
            Ok(ReplyEvent::Row) => handler.row_response(self, frame),
            Ok(ReplyEvent::RowEof) => handler.row_eof_response(self, frame),
            Err(e) => {
                tracing::warn!(participant = %self.id, error = %e, "protocol error from backend");
                handler.connection_error(self, &e);
                self.conn.close(&e.to_string());
            }
        }
    }

    fn on_close(&self, reason: &str) {
        match self.handler() {
            Some(handler) => handler.connection_close(self, reason),
            None => tracing::debug!(participant = %self.id, reason, "backend closed"),
        }
    }
}

impl Drop for BackendService {
    fn drop(&mut self) {
        if !self.conn.is_closed() {
            self.conn.close("backend released");
        }
    }
}
