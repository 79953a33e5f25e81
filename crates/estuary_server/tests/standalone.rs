//! End-to-end tests against a standalone node over a real TCP socket,
//! speaking the wire protocol the way a client library would.

use std::sync::Arc;
use std::time::Duration;

use estuary_protocol::{packet, Dictionary, Message, MessageType, Packet, PacketDecoder, PacketType};
use estuary_server::{
    Component, ComponentOptions, Components, HandlerRegistry, Node, Options, Scheduler,
    ServerError, Session,
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct Ping {
    content: String,
}

struct S;

impl Component for S {
    fn name(&self) -> &'static str {
        "S"
    }

    fn handlers(&self, registry: &mut HandlerRegistry) {
        registry.register("Ping", |session: &Arc<Session>, msg: Ping| {
            session.response(&serde_json::json!({ "content": msg.content }))
        });
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
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

    /// Handshake then ack, returning the server's handshake JSON.
    async fn open_session(&mut self) -> serde_json::Value {
        self.send_packet(PacketType::Handshake, b"{}").await;
        let reply = self.next_packet().await;
        assert_eq!(reply.kind, PacketType::Handshake);
        let value: serde_json::Value = serde_json::from_slice(&reply.data).unwrap();
        self.send_packet(PacketType::HandshakeAck, &[]).await;
        value
    }

    async fn send_message(&mut self, message: &Message, dict: &Dictionary) {
        let body = message.encode(dict).unwrap();
        self.send_packet(PacketType::Data, &body).await;
    }

    /// Skip heartbeats until a `Data` packet arrives, decoded as a message.
    async fn next_message(&mut self, dict: &Dictionary) -> Message {
        loop {
            let packet = self.next_packet().await;
            match packet.kind {
                PacketType::Data => return Message::decode(&packet.data, dict).unwrap(),
                PacketType::Heartbeat => continue,
                other => panic!("unexpected packet: {other:?}"),
            }
        }
    }
}

fn standalone_options() -> Options {
    let mut components = Components::new();
    components.register(S);
    Options::new().with_components(components)
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_pong_round_trip() -> Result<(), ServerError> {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let node = Node::startup(&addr, standalone_options().with_gate_addr(&addr)).await?;

    let dict = Dictionary::empty();
    let mut client = Client::connect(&addr).await;
    let handshake = client.open_session().await;
    assert_eq!(handshake["code"], 200);
    assert_eq!(handshake["sys"]["heartbeat"], 30);

    let payload = serde_json::to_vec(&serde_json::json!({"content": "hi"})).unwrap();
    client
        .send_message(&Message::request(1, "S.Ping", payload), &dict)
        .await;

    let response = client.next_message(&dict).await;
    assert_eq!(response.kind, MessageType::Response);
    assert_eq!(response.id, 1);
    let body: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
    assert_eq!(body["content"], "hi");

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dictionary_route_round_trips() -> Result<(), ServerError> {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let options = standalone_options()
        .with_gate_addr(&addr)
        .with_dictionary([("S.Ping".to_string(), 0x0001)])?;
    let node = Node::startup(&addr, options).await?;

    let dict = Dictionary::new([("S.Ping".to_string(), 0x0001)]).unwrap();
    let mut client = Client::connect(&addr).await;
    client.open_session().await;

    let payload = serde_json::to_vec(&serde_json::json!({"content": "compressed"})).unwrap();
    let request = Message::request(7, "S.Ping", payload.clone());

    // The compressed form is shorter by len("S.Ping") - 1 bytes.
    let raw = request.encode(&Dictionary::empty()).unwrap();
    let compressed = request.encode(&dict).unwrap();
    assert_eq!(raw.len() - compressed.len(), "S.Ping".len() - 1);

    client.send_message(&request, &dict).await;
    let response = client.next_message(&dict).await;
    assert_eq!(response.id, 7);
    let body: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
    assert_eq!(body["content"], "compressed");

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn data_before_ack_closes_the_session() -> Result<(), ServerError> {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let node = Node::startup(&addr, standalone_options().with_gate_addr(&addr)).await?;

    let mut client = Client::connect(&addr).await;
    // Straight to data, no handshake.
    let payload = serde_json::to_vec(&serde_json::json!({"content": "x"})).unwrap();
    client
        .send_message(&Message::request(1, "S.Ping", payload), &Dictionary::empty())
        .await;

    // The server must drop the connection rather than answer.
    let mut buf = [0u8; 64];
    let read = timeout(IO_TIMEOUT, client.stream.read(&mut buf))
        .await
        .expect("server did not close in time");
    assert!(matches!(read, Ok(0) | Err(_)));

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn server_heartbeats_on_its_own_clock() -> Result<(), ServerError> {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let options = standalone_options()
        .with_gate_addr(&addr)
        .with_heartbeat_interval(Duration::from_secs(1));
    let node = Node::startup(&addr, options).await?;

    let mut client = Client::connect(&addr).await;
    let handshake = client.open_session().await;
    assert_eq!(handshake["sys"]["heartbeat"], 1);

    // Keep our side alive and wait for the server's tick.
    client.send_packet(PacketType::Heartbeat, &[]).await;
    let packet = client.next_packet().await;
    assert_eq!(packet.kind, PacketType::Heartbeat);

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_client_is_dropped_after_two_intervals() -> Result<(), ServerError> {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let options = standalone_options()
        .with_gate_addr(&addr)
        .with_heartbeat_interval(Duration::from_secs(1));
    let node = Node::startup(&addr, options).await?;

    let closes = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = closes.clone();
    node.env().lifetime.on_closed(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    });

    let mut client = Client::connect(&addr).await;
    client.open_session().await;

    // Say nothing. The server closes us once the silence passes twice
    // the heartbeat interval; absorb its heartbeats until EOF.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    let mut buf = [0u8; 256];
    loop {
        let read = tokio::time::timeout_at(deadline, client.stream.read(&mut buf))
            .await
            .expect("server did not drop the silent client");
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(closes.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(node.session_count(), 0);

    node.shutdown().await;
    Ok(())
}

/// Entering the lobby pins the session to a dedicated worker; the room
/// service is declared to dispatch through it.
struct Lobby;

impl Component for Lobby {
    fn name(&self) -> &'static str {
        "Lobby"
    }

    fn handlers(&self, registry: &mut HandlerRegistry) {
        registry.register("Enter", |session: &Arc<Session>, _msg: serde_json::Value| {
            session.bind_scheduler("worker", Arc::new(Scheduler::new(Duration::from_millis(1))));
            session.response(&serde_json::json!({ "entered": true }))
        });
    }
}

struct Room;

impl Component for Room {
    fn name(&self) -> &'static str {
        "Room"
    }

    fn handlers(&self, registry: &mut HandlerRegistry) {
        registry.register("Say", |session: &Arc<Session>, msg: serde_json::Value| {
            session.response(&serde_json::json!({ "echo": msg["text"] }))
        });
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn service_dispatches_through_session_scheduler() -> Result<(), ServerError> {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let mut components = Components::new();
    components.register(Lobby);
    components.register_with(Room, ComponentOptions::new().with_scheduler_name("worker"));
    let node = Node::startup(
        &addr,
        Options::new().with_components(components).with_gate_addr(&addr),
    )
    .await?;

    let dict = Dictionary::empty();
    let mut client = Client::connect(&addr).await;
    client.open_session().await;

    let payload = serde_json::to_vec(&serde_json::json!({})).unwrap();
    client
        .send_message(&Message::request(1, "Lobby.Enter", payload), &dict)
        .await;
    let response = client.next_message(&dict).await;
    assert_eq!(response.id, 1);

    // Now served by the session's bound worker, not the main scheduler.
    let payload = serde_json::to_vec(&serde_json::json!({"text": "over here"})).unwrap();
    client
        .send_message(&Message::request(2, "Room.Say", payload), &dict)
        .await;
    let response = client.next_message(&dict).await;
    assert_eq!(response.id, 2);
    let body: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
    assert_eq!(body["echo"], "over here");

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_stream_closes_the_session() -> Result<(), ServerError> {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let node = Node::startup(&addr, standalone_options().with_gate_addr(&addr)).await?;

    let mut client = Client::connect(&addr).await;
    // Unknown packet type 0x7f.
    client.stream.write_all(&[0x7f, 0, 0, 0]).await.unwrap();

    let mut buf = [0u8; 64];
    let read = timeout(IO_TIMEOUT, client.stream.read(&mut buf))
        .await
        .expect("server did not close in time");
    assert!(matches!(read, Ok(0) | Err(_)));

    node.shutdown().await;
    Ok(())
}
