use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use zero_shard::error::{ER_XAER_NOTA, Error, Result, ServerError};
use zero_shard::protocol::packet::{OkPacket, parse_err};
use zero_shard::protocol::{Command, RawPacket};
use zero_shard::{
    Backend, BackendInfo, ClientConnection, Coordinator, ParticipantId, ResponseHandler, Session,
    ShardSession, begin_transaction_commit, begin_transaction_rollback,
    interrupt_current_transaction,
};

// --- fakes ---

struct FakeBackend {
    id: ParticipantId,
    commands: Mutex<Vec<String>>,
    handler: Mutex<Option<Weak<dyn ResponseHandler>>>,
    fail_send: AtomicBool,
}

impl FakeBackend {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ParticipantId::new(name),
            commands: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            fail_send: AtomicBool::new(false),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn last_command(&self) -> Option<String> {
        self.commands.lock().unwrap().last().cloned()
    }

    fn handler(&self) -> Arc<dyn ResponseHandler> {
        self.handler
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .unwrap()
    }

    fn ok(&self) {
        self.handler().ok_response(self, &ok_frame(1, ""));
    }

    fn ok_with(&self, frame: &[u8]) {
        self.handler().ok_response(self, frame);
    }

    fn err(&self, code: u16, message: &str) {
        self.handler()
            .error_response(self, ServerError::new(code, message));
    }

    fn close(&self, reason: &str) {
        self.handler().connection_close(self, reason);
    }

    fn protocol_error(&self, message: &str) {
        self.handler()
            .connection_error(self, &Error::Protocol(message.into()));
    }
}

impl Backend for FakeBackend {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            host: format!("{}.db", self.id),
            port: 3306,
            schema: Some("orders".into()),
            thread_id: 42,
        }
    }

    fn send_command(&self, command: &Command) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("link is down".into()));
        }
        self.commands.lock().unwrap().push(command.sql().to_string());
        Ok(())
    }

    fn set_response_handler(&self, handler: Weak<dyn ResponseHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

#[derive(Default)]
struct Client {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl Client {
    fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
    }

    fn oks(&self) -> usize {
        self.packets()
            .iter()
            .filter(|p| RawPacket::parse(p).unwrap().is_ok())
            .count()
    }

    fn errors(&self) -> Vec<ServerError> {
        self.packets()
            .iter()
            .filter_map(|p| {
                let packet = RawPacket::parse(p).unwrap();
                packet.is_error().then(|| parse_err(packet.payload).unwrap())
            })
            .collect()
    }
}

impl ClientConnection for Client {
    fn write(&self, packet: &[u8]) -> Result<()> {
        self.packets.lock().unwrap().push(packet.to_vec());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

fn ok_frame(sequence_id: u8, info: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    OkPacket {
        info: info.to_string(),
        ..Default::default()
    }
    .write(&mut buf, sequence_id);
    buf
}

fn setup(xa: bool, names: &[&str]) -> (Arc<ShardSession>, Arc<Client>, Vec<Arc<FakeBackend>>) {
    let client = Arc::new(Client::default());
    let session = ShardSession::new(1, Arc::clone(&client) as Arc<dyn ClientConnection>, "zero_shard");
    session.set_xa(xa);
    let backends: Vec<_> = names.iter().map(|n| FakeBackend::new(n)).collect();
    for backend in &backends {
        session.attach(Arc::clone(backend) as Arc<dyn Backend>);
    }
    (session, client, backends)
}

// --- plain transactions ---

#[test]
fn test_two_shard_commit_happy_path() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    assert_eq!(b[0].commands(), ["COMMIT"]);
    assert_eq!(b[1].commands(), ["COMMIT"]);

    b[0].ok();
    assert!(client.packets().is_empty());
    b[1].ok();

    assert_eq!(client.packets().len(), 1);
    assert_eq!(client.oks(), 1);
    assert!(session.participants().is_empty());
    assert!(!session.coordinator().is_in_flight());
}

#[test]
fn test_two_shard_commit_one_failure() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();

    b[0].err(1213, "Deadlock found when trying to get lock");
    b[1].ok();

    assert_eq!(client.packets().len(), 1);
    assert_eq!(client.oks(), 0);
    let errors = client.errors();
    assert!(errors[0].message.contains("Deadlock"));
}

#[test]
fn test_mid_cohort_disconnect() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();

    b[0].close("stream closed");
    assert!(client.packets().is_empty());
    assert_eq!(session.participants().len(), 1);

    b[1].ok();
    let errors = client.errors();
    assert_eq!(client.packets().len(), 1);
    assert!(errors[0].message.contains("was closed"));
    assert!(errors[0].message.contains("dn1.db:3306"));
}

#[test]
fn test_duplicate_reply_does_not_complete_cohort() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();

    b[0].ok();
    b[0].ok();
    assert!(client.packets().is_empty());
    assert!(session.coordinator().is_in_flight());

    b[1].ok();
    assert_eq!(client.oks(), 1);
}

#[test]
fn test_rollback_marks_discard() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    begin_transaction_rollback(session.as_ref()).unwrap();
    assert!(session.is_discard());
    assert_eq!(b[0].commands(), ["ROLLBACK"]);

    b[0].ok();
    b[1].ok();
    assert_eq!(client.oks(), 1);
}

#[test]
fn test_send_failure_counts_as_error() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    b[0].fail_send.store(true, Ordering::SeqCst);
    begin_transaction_commit(session.as_ref()).unwrap();
    assert!(client.packets().is_empty());

    b[1].ok();
    let errors = client.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("link is down"));
}

#[test]
fn test_single_participant_echoes_backend_ok() {
    let (session, client, b) = setup(false, &["dn1"]);
    session.set_packet_id(0);
    begin_transaction_commit(session.as_ref()).unwrap();

    b[0].ok_with(&ok_frame(7, "from backend"));
    let packets = client.packets();
    assert_eq!(packets.len(), 1);
    let packet = RawPacket::parse(&packets[0]).unwrap();
    assert_eq!(packet.sequence_id, 1);
    assert_eq!(OkPacket::parse(packet.payload).unwrap().info, "from backend");
}

#[test]
fn test_empty_participant_set_concludes_immediately() {
    let (session, client, _b) = setup(true, &[]);
    begin_transaction_commit(session.as_ref()).unwrap();
    assert_eq!(client.oks(), 1);
    assert!(!session.coordinator().is_in_flight());
}

#[test]
fn test_begin_while_in_flight_is_rejected() {
    let (session, client, b) = setup(false, &["dn1"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    assert!(matches!(
        begin_transaction_rollback(session.as_ref()),
        Err(Error::InvalidState(_))
    ));
    b[0].ok();
    assert_eq!(client.packets().len(), 1);
}

#[test]
fn test_closed_session_suppresses_write_but_releases() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    session.close("client quit");

    b[0].ok();
    b[1].ok();
    assert!(client.packets().is_empty());
    assert!(session.participants().is_empty());
}

#[test]
fn test_multi_statement_continues_after_success() {
    let (session, _client, b) = setup(false, &["dn1"]);
    let continued = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&continued);
    session.set_multi_statement(true);
    session.set_next_statement_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    begin_transaction_commit(session.as_ref()).unwrap();
    b[0].ok();
    assert_eq!(continued.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_replies_complete_once() {
    let names: Vec<String> = (0..16).map(|i| format!("dn{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (session, client, backends) = setup(false, &refs);
    begin_transaction_commit(session.as_ref()).unwrap();

    std::thread::scope(|s| {
        for (i, backend) in backends.iter().enumerate() {
            s.spawn(move || {
                if i == 5 {
                    backend.err(1205, "Lock wait timeout exceeded");
                } else {
                    backend.ok();
                }
            });
        }
    });

    assert_eq!(client.packets().len(), 1);
    assert!(client.errors()[0].message.contains("Lock wait timeout"));
}

// --- XA ---

#[test]
fn test_xa_commit_happy_path() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    let xid = session.coordinator().xid().unwrap();
    assert_eq!(xid.gtrid(), "zero_shard.1.1");
    assert_eq!(b[0].commands(), ["XA END 'zero_shard.1.1','dn1'"]);
    assert_eq!(b[1].commands(), ["XA END 'zero_shard.1.1','dn2'"]);

    b[0].ok();
    b[1].ok();
    assert_eq!(b[0].last_command().unwrap(), "XA PREPARE 'zero_shard.1.1','dn1'");
    assert_eq!(session.coordinator().current_stage(), Some("XA PREPARE"));

    b[1].ok();
    b[0].ok();
    assert_eq!(b[1].last_command().unwrap(), "XA COMMIT 'zero_shard.1.1','dn2'");

    b[0].ok();
    b[1].ok();
    assert_eq!(client.packets().len(), 1);
    assert_eq!(client.oks(), 1);
    assert_eq!(b[0].commands().len(), 3);
    assert!(!session.is_xa());
}

#[test]
fn test_xa_prepare_failure_rolls_back_everyone() {
    let (session, client, b) = setup(true, &["dn1", "dn2", "dn3"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    for backend in &b {
        backend.ok();
    }

    b[1].err(1614, "Transaction branch was rolled back: deadlock");
    b[0].ok();
    b[2].ok();
    for backend in &b {
        assert!(backend.last_command().unwrap().starts_with("XA ROLLBACK"));
    }
    assert!(session.is_discard());
    assert!(client.packets().is_empty());

    for backend in &b {
        backend.ok();
    }
    let errors = client.errors();
    assert_eq!(client.packets().len(), 1);
    assert!(errors[0].message.contains("deadlock"));
}

#[test]
fn test_xa_rollback_tolerates_unknown_xid() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_rollback(session.as_ref()).unwrap();
    b[0].ok();
    b[1].err(1399, "XAER_RMFAIL: The command cannot be executed");
    assert!(b[1].last_command().unwrap().starts_with("XA ROLLBACK"));

    b[0].err(ER_XAER_NOTA, "XAER_NOTA: Unknown XID");
    b[1].ok();
    assert_eq!(client.oks(), 1);
    assert_eq!(client.packets().len(), 1);
}

#[test]
fn test_xa_commit_failure_is_retried_once() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    for _ in 0..2 {
        b[0].ok();
        b[1].ok();
    }
    b[0].err(1205, "Lock wait timeout exceeded");
    b[1].ok();

    assert_eq!(
        b[0].commands()[2..],
        [
            "XA COMMIT 'zero_shard.1.1','dn1'".to_string(),
            "XA COMMIT 'zero_shard.1.1','dn1'".to_string()
        ]
    );
    assert_eq!(b[1].commands().len(), 3);
    assert!(client.packets().is_empty());

    b[0].ok();
    assert_eq!(client.oks(), 1);
}

#[test]
fn test_interrupt_mid_prepare() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    b[0].ok();
    b[1].ok();
    assert_eq!(session.coordinator().current_stage(), Some("XA PREPARE"));

    interrupt_current_transaction(session.as_ref(), "timeout").unwrap();
    let errors = client.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("timeout"));
    assert_eq!(session.tx_interrupt().as_deref(), Some("timeout"));

    interrupt_current_transaction(session.as_ref(), "timeout").unwrap();
    assert_eq!(client.packets().len(), 1);

    b[0].ok();
    b[1].ok();
    assert!(b[0].last_command().unwrap().starts_with("XA ROLLBACK"));
    b[0].ok();
    b[1].ok();

    assert_eq!(client.packets().len(), 1);
    assert!(session.participants().is_empty());
    assert!(matches!(
        interrupt_current_transaction(session.as_ref(), "timeout"),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_close_between_stages_applies_to_open_cohort() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();

    b[0].ok();
    b[0].close("stream closed");
    assert_eq!(session.participants().len(), 1);
    assert!(client.packets().is_empty());

    b[1].ok();
    assert_eq!(b[0].commands().len(), 1);
    assert!(b[1].last_command().unwrap().starts_with("XA ROLLBACK"));

    b[1].ok();
    let errors = client.errors();
    assert_eq!(client.packets().len(), 1);
    assert!(errors[0].message.contains("was closed"));
}

#[test]
fn test_lost_branch_during_commit_fails() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    for _ in 0..2 {
        b[0].ok();
        b[1].ok();
    }
    b[0].close("stream closed");
    b[1].ok();

    let errors = client.errors();
    assert_eq!(client.packets().len(), 1);
    assert!(errors[0].message.contains("was closed"));
}

#[test]
fn test_xa_unreachable_participant_fails_commit() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    for _ in 0..2 {
        b[0].ok();
        b[1].ok();
    }
    assert_eq!(session.coordinator().current_stage(), Some("XA COMMIT"));

    b[0].ok();
    session
        .coordinator()
        .on_connect_error(None, &Error::ConnectionClosed("dn2 unreachable".into()));

    assert_eq!(client.packets().len(), 1);
    assert_eq!(client.oks(), 0);
    assert!(client.errors()[0].message.contains("dn2 unreachable"));
    assert!(!session.coordinator().is_in_flight());

    // a late reply from the unreachable branch changes nothing
    b[1].ok();
    assert_eq!(client.packets().len(), 1);
}

#[test]
fn test_protocol_error_after_reply_does_not_advance() {
    let (session, client, b) = setup(true, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    b[0].ok();
    b[1].ok();
    b[0].ok();

    b[0].protocol_error("Empty packet");
    assert_eq!(session.coordinator().current_stage(), Some("XA PREPARE"));
    assert_eq!(b[1].commands().len(), 2);
    assert!(client.packets().is_empty());

    b[1].ok();
    assert!(b[1].last_command().unwrap().starts_with("XA COMMIT"));
    b[0].ok();
    b[1].ok();
    assert_eq!(client.packets().len(), 1);
    assert_eq!(client.oks(), 1);
}

#[test]
fn test_protocol_error_from_pending_participant_counts_once() {
    let (session, client, b) = setup(false, &["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();

    b[0].protocol_error("unexpected packet");
    // the backend closes its link after a protocol error
    b[0].close("Protocol error: unexpected packet");
    assert!(client.packets().is_empty());
    assert_eq!(session.coordinator().current_stage(), Some("COMMIT"));

    b[1].ok();
    let errors = client.errors();
    assert_eq!(client.packets().len(), 1);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("unexpected packet"));
}

// --- session seam ---

struct RecordingSession {
    coordinator: Arc<Coordinator>,
    participants: Mutex<Vec<Arc<dyn Backend>>>,
    cleared: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSession {
    fn new(participants: Vec<Arc<dyn Backend>>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| Self {
            coordinator: Coordinator::new(this.clone() as Weak<dyn Session>, "rec"),
            participants: Mutex::new(participants),
            cleared: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        })
    }
}

impl Session for RecordingSession {
    fn session_id(&self) -> u64 {
        9
    }

    fn participants(&self) -> Vec<Arc<dyn Backend>> {
        self.participants.lock().unwrap().clone()
    }

    fn detach(&self, id: &ParticipantId) -> Option<Arc<dyn Backend>> {
        let mut participants = self.participants.lock().unwrap();
        let pos = participants.iter().position(|p| p.id() == id)?;
        Some(participants.remove(pos))
    }

    fn is_xa(&self) -> bool {
        true
    }

    fn next_xa_seq(&self) -> u64 {
        1
    }

    fn mark_discard(&self) {}

    fn is_discard(&self) -> bool {
        false
    }

    fn clear_transaction_resources(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        self.participants.lock().unwrap().clear();
    }

    fn clear_savepoints(&self) {}

    fn write_to_client(&self, packet: &[u8]) {
        self.writes.lock().unwrap().push(packet.to_vec());
    }

    fn next_packet_sequence_id(&self) -> u8 {
        1
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn is_multi_statement(&self) -> bool {
        false
    }

    fn multi_statement_next(&self) {}

    fn set_tx_interrupt(&self, _reason: &str) {}

    fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }
}

#[test]
fn test_terminal_stage_clears_resources_once() {
    let b = [FakeBackend::new("dn1"), FakeBackend::new("dn2")];
    let session = RecordingSession::new(
        b.iter()
            .map(|backend| Arc::clone(backend) as Arc<dyn Backend>)
            .collect(),
    );
    begin_transaction_commit(session.as_ref()).unwrap();
    b[0].ok();
    b[1].ok();
    b[0].err(1614, "prepare failed");
    b[1].ok();
    b[0].ok();
    b[1].ok();

    // late replies after conclusion
    b[0].ok();
    b[1].close("stream closed");

    assert_eq!(session.cleared.load(Ordering::SeqCst), 1);
    assert!(session.participants().is_empty());
    assert_eq!(session.writes.lock().unwrap().len(), 1);
}
