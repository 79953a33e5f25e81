//! Cluster-plane tests: master membership churn and gate-to-backend
//! forwarding with the push path back to the real client.

use std::sync::Arc;
use std::time::Duration;

use estuary_protocol::{packet, Dictionary, Message, MessageType, Packet, PacketDecoder, PacketType};
use estuary_server::{Component, Components, HandlerRegistry, Node, Options, ServerError, Session};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll until `probe` returns true or the deadline passes.
async fn wait_until(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[derive(Deserialize)]
struct NewUser {
    nickname: String,
}

/// Backend service: greets every announced user with a push back through
/// the owning gate.
struct TopicService;

impl Component for TopicService {
    fn name(&self) -> &'static str {
        "Topic"
    }

    fn handlers(&self, registry: &mut HandlerRegistry) {
        registry.register("NewUser", |session: &Arc<Session>, msg: NewUser| {
            session.push(
                "Topic.OnUser",
                &serde_json::json!({ "nickname": msg.nickname }),
            )
        });
    }
}

struct Client {
    stream: TcpStream,
    decoder: PacketDecoder,
    pending: Vec<Packet>,
}

impl Client {
    async fn connect(addr: &str) -> Self {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self {
            stream,
            decoder: PacketDecoder::new(),
            pending: Vec::new(),
        }
    }

    async fn send_packet(&mut self, kind: PacketType, payload: &[u8]) {
        let bytes = packet::encode(kind, payload).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn next_packet(&mut self) -> Packet {
        loop {
            if !self.pending.is_empty() {
                return self.pending.remove(0);
            }
            let mut buf = [0u8; 2048];
            let n = timeout(IO_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(n > 0, "server closed the connection");
            self.pending.extend(self.decoder.feed(&buf[..n]).unwrap());
        }
    }

    async fn open_session(&mut self) {
        self.send_packet(PacketType::Handshake, b"{}").await;
        let reply = self.next_packet().await;
        assert_eq!(reply.kind, PacketType::Handshake);
        self.send_packet(PacketType::HandshakeAck, &[]).await;
    }

    async fn next_message(&mut self) -> Message {
        loop {
            let packet = self.next_packet().await;
            match packet.kind {
                PacketType::Data => {
                    return Message::decode(&packet.data, &Dictionary::empty()).unwrap()
                }
                PacketType::Heartbeat => continue,
                other => panic!("unexpected packet: {other:?}"),
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_churn_propagates_to_backends() -> Result<(), ServerError> {
    let master_addr = format!("127.0.0.1:{}", free_port().await);
    let b1_addr = format!("127.0.0.1:{}", free_port().await);
    let b2_addr = format!("127.0.0.1:{}", free_port().await);

    let master = Node::startup(&master_addr, Options::new().with_master().with_label("hub")).await?;

    let mut components = Components::new();
    components.register(TopicService);
    let backend1 = Node::startup(
        &b1_addr,
        Options::new()
            .with_registry_addr(&master_addr)
            .with_components(components)
            .with_label("b1"),
    )
    .await?;

    // b1 knows the master; the master knows b1's services.
    assert_eq!(backend1.members().len(), 2);
    wait_until("master to learn Topic", || {
        master.remote_services().contains(&"Topic".to_string())
    })
    .await;

    // A second backend with another copy of the same service.
    let mut components = Components::new();
    components.register(TopicService);
    let backend2 = Node::startup(
        &b2_addr,
        Options::new()
            .with_registry_addr(&master_addr)
            .with_components(components)
            .with_label("b2"),
    )
    .await?;

    // The master tells b1 about b2.
    wait_until("b1 to learn about b2", || backend1.members().len() == 3).await;
    assert!(backend1.remote_services().contains(&"Topic".to_string()));

    // b2 leaves; the master broadcasts the departure.
    backend2.shutdown().await;
    wait_until("b1 to forget b2", || backend1.members().len() == 2).await;

    backend1.shutdown().await;
    master.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn notify_forwards_to_backend_and_push_returns_to_client() -> Result<(), ServerError> {
    let master_addr = format!("127.0.0.1:{}", free_port().await);
    let backend_addr = format!("127.0.0.1:{}", free_port().await);
    let gate_service_addr = format!("127.0.0.1:{}", free_port().await);
    let gate_addr = format!("127.0.0.1:{}", free_port().await);

    let master = Node::startup(&master_addr, Options::new().with_master().with_label("hub")).await?;

    let mut components = Components::new();
    components.register(TopicService);
    let backend = Node::startup(
        &backend_addr,
        Options::new()
            .with_registry_addr(&master_addr)
            .with_components(components)
            .with_label("topic-backend"),
    )
    .await?;

    let gate = Node::startup(
        &gate_service_addr,
        Options::new()
            .with_registry_addr(&master_addr)
            .with_gate_addr(&gate_addr)
            .with_gate_id(1)
            .with_label("gate"),
    )
    .await?;
    assert_eq!(gate.node_type(), "Gate");
    wait_until("gate to learn Topic", || {
        gate.remote_services().contains(&"Topic".to_string())
    })
    .await;

    let mut client = Client::connect(&gate_addr).await;
    client.open_session().await;

    // The gate has no Topic service; the notify forwards to the backend,
    // whose handler pushes back through the gate to this socket.
    let payload = serde_json::to_vec(&serde_json::json!({"nickname": "kelp"})).unwrap();
    let notify = Message::notify("Topic.NewUser", payload);
    let body = notify.encode(&Dictionary::empty()).unwrap();
    client.send_packet(PacketType::Data, &body).await;

    let push = client.next_message().await;
    assert_eq!(push.kind, MessageType::Push);
    assert_eq!(push.route.as_deref(), Some("Topic.OnUser"));
    let value: serde_json::Value = serde_json::from_slice(&push.data).unwrap();
    assert_eq!(value["nickname"], "kelp");

    // The backend materialized an acceptor session under the gate's id.
    assert_eq!(backend.session_count(), 1);

    gate.shutdown().await;
    backend.shutdown().await;
    master.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_to_missing_service_leaves_client_alone() -> Result<(), ServerError> {
    let master_addr = format!("127.0.0.1:{}", free_port().await);
    let gate_service_addr = format!("127.0.0.1:{}", free_port().await);
    let gate_addr = format!("127.0.0.1:{}", free_port().await);

    let master = Node::startup(&master_addr, Options::new().with_master()).await?;
    let gate = Node::startup(
        &gate_service_addr,
        Options::new()
            .with_registry_addr(&master_addr)
            .with_gate_addr(&gate_addr),
    )
    .await?;

    let mut client = Client::connect(&gate_addr).await;
    client.open_session().await;

    // Nobody provides this service; the notify is dropped with a log,
    // the session stays healthy.
    let notify = Message::notify("Ghost.Poke", b"{}".to_vec());
    let body = notify.encode(&Dictionary::empty()).unwrap();
    client.send_packet(PacketType::Data, &body).await;

    // Session still works: heartbeat exchange proves it is alive.
    client.send_packet(PacketType::Heartbeat, &[]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gate.session_count(), 1);

    gate.shutdown().await;
    master.shutdown().await;
    Ok(())
}
