use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use zero_shard::backend::BackendService;
use zero_shard::buffer_pool::BufferPool;
use zero_shard::error::{Result, ServerError};
use zero_shard::net::{Connection, IoProcessor, IoTasks, spawn};
use zero_shard::protocol::packet::{OkPacket, parse_err, write_err};
use zero_shard::protocol::{PacketHeader, RawPacket};
use zero_shard::{
    Backend, BackendInfo, ClientConnection, Opts, Session, ShardSession,
    begin_transaction_commit,
};

#[derive(Default)]
struct Client {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl Client {
    fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
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

struct Shard {
    backend: Arc<BackendService>,
    peer: DuplexStream,
    tasks: IoTasks,
}

fn shard(processor: &Arc<IoProcessor>, name: &str) -> Shard {
    let (local, peer) = tokio::io::duplex(1024);
    let conn = Connection::new(processor, &format!("{name}.db"), 3306, &Opts::default());
    let tasks = spawn(Arc::clone(&conn), local);
    let info = BackendInfo {
        host: format!("{name}.db"),
        port: 3306,
        schema: Some("orders".into()),
        thread_id: 7,
    };
    Shard {
        backend: BackendService::new(name.into(), info, conn),
        peer,
        tasks,
    }
}

/// Read one command packet from the backend side and return its SQL.
async fn read_query(peer: &mut DuplexStream) -> String {
    let mut header = [0u8; PacketHeader::SIZE];
    peer.read_exact(&mut header).await.unwrap();
    let len = PacketHeader::parse(&header).unwrap().payload_length();
    let mut payload = vec![0u8; len];
    peer.read_exact(&mut payload).await.unwrap();
    assert_eq!(payload[0], 0x03);
    String::from_utf8(payload[1..].to_vec()).unwrap()
}

async fn reply_ok(peer: &mut DuplexStream) {
    let mut buf = Vec::new();
    OkPacket::default().write(&mut buf, 1);
    peer.write_all(&buf).await.unwrap();
}

async fn wait_for_packets(client: &Client, n: usize) -> Vec<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let packets = client.packets();
            if packets.len() >= n {
                return packets;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

fn setup(names: &[&str]) -> (Arc<ShardSession>, Arc<Client>, Vec<Shard>, Arc<BufferPool>) {
    let pool = Arc::new(BufferPool::new(32, 256));
    let processor = IoProcessor::new("backend", Arc::clone(&pool));
    let client = Arc::new(Client::default());
    let session = ShardSession::new(3, Arc::clone(&client) as Arc<dyn ClientConnection>, "zs");
    let shards: Vec<Shard> = names.iter().map(|n| shard(&processor, n)).collect();
    for s in &shards {
        session.attach(Arc::clone(&s.backend) as Arc<dyn Backend>);
    }
    (session, client, shards, pool)
}

#[tokio::test]
async fn test_xa_commit_over_the_wire() {
    let (session, client, mut shards, _pool) = setup(&["dn1", "dn2"]);
    session.set_xa(true);
    begin_transaction_commit(session.as_ref()).unwrap();

    for keyword in ["XA END", "XA PREPARE", "XA COMMIT"] {
        for s in &mut shards {
            let sql = read_query(&mut s.peer).await;
            assert_eq!(sql, format!("{keyword} 'zs.3.1','{}'", s.backend.id()));
        }
        for s in &mut shards {
            reply_ok(&mut s.peer).await;
        }
    }

    let packets = wait_for_packets(&client, 1).await;
    assert_eq!(packets.len(), 1);
    assert!(RawPacket::parse(&packets[0]).unwrap().is_ok());
}

#[tokio::test]
async fn test_backend_error_reaches_client_once() {
    let (session, client, mut shards, _pool) = setup(&["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();

    assert_eq!(read_query(&mut shards[0].peer).await, "COMMIT");
    assert_eq!(read_query(&mut shards[1].peer).await, "COMMIT");

    let mut err = Vec::new();
    write_err(&mut err, 1, &ServerError::new(1213, "Deadlock found"));
    shards[0].peer.write_all(&err).await.unwrap();
    reply_ok(&mut shards[1].peer).await;

    let packets = wait_for_packets(&client, 1).await;
    let packet = RawPacket::parse(&packets[0]).unwrap();
    assert!(packet.is_error());
    assert!(parse_err(packet.payload).unwrap().message.contains("Deadlock"));
}

#[tokio::test]
async fn test_result_set_is_a_protocol_violation() {
    let (session, client, mut shards, _pool) = setup(&["dn1"]);
    begin_transaction_commit(session.as_ref()).unwrap();
    read_query(&mut shards[0].peer).await;

    let packets: [(u8, &[u8]); 5] = [
        (1, b"\x01"),
        (2, b"\x03def"),
        (3, b"\xFE\x00\x00\x02\x00"),
        (4, b"\x011"),
        (5, b"\xFE\x00\x00\x02\x00"),
    ];
    let mut reply = Vec::new();
    for (seq, payload) in packets {
        reply.extend_from_slice(&[payload.len() as u8, 0, 0, seq]);
        reply.extend_from_slice(payload);
    }
    shards[0].peer.write_all(&reply).await.unwrap();

    let packets = wait_for_packets(&client, 1).await;
    let packet = RawPacket::parse(&packets[0]).unwrap();
    assert!(packet.is_error());
    assert!(
        parse_err(packet.payload)
            .unwrap()
            .message
            .contains("unexpected result set")
    );
}

#[tokio::test]
async fn test_backend_disconnect_fails_commit() {
    let (session, client, shards, pool) = setup(&["dn1", "dn2"]);
    begin_transaction_commit(session.as_ref()).unwrap();

    let mut shards = shards.into_iter();
    let first = shards.next().unwrap();
    let mut second = shards.next().unwrap();

    drop(first.peer);
    first.tasks.join().await;
    assert_eq!(session.participants().len(), 1);

    read_query(&mut second.peer).await;
    reply_ok(&mut second.peer).await;

    let packets = wait_for_packets(&client, 1).await;
    let packet = RawPacket::parse(&packets[0]).unwrap();
    let err = parse_err(packet.payload).unwrap();
    assert!(err.message.contains("dbInstance[dn1.db:3306]"));
    assert!(err.message.contains("was closed"));

    // releasing the backends closes their links
    drop(first.backend);
    drop(second.backend);
    second.tasks.join().await;
    assert_eq!(pool.outstanding(), 0);
}
