use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use tokio::{sync::mpsc, time::timeout};
use wust_engine::{
    ChannelHandler, ClientConfig, CloseReason, Error, Event, Frame, FrameCursor, FrameState, Message, Opcode,
    Router, ServerConfig, ServerHandle, State, WebSocketClient, WebSocketServer, handshake,
    server::{ConnId, Response},
};

const WAIT: Duration = Duration::from_secs(5);

fn spawn_server() -> (ServerHandle, Receiver<(ConnId, Option<CloseReason>)>) {
    let (removed_tx, removed_rx) = crossbeam_channel::unbounded();
    let router = Router::new()
        .get("/ping", |_| Response::ok("pong"))
        .post("/echo", |req| Response::ok(req.body));
    let handle = WebSocketServer::bind("127.0.0.1:0", ServerConfig::default().with_keepalive(None))
        .unwrap()
        .router(router)
        .on_binary(|_, bytes| Some(bytes.to_vec()))
        .on_remove(move |id, reason| {
            let _ = removed_tx.send((id, reason));
        })
        .spawn()
        .unwrap();
    (handle, removed_rx)
}

async fn connect(addr: SocketAddr) -> (WebSocketClient, mpsc::Receiver<Event>) {
    connect_with(addr, ClientConfig::default().with_keepalive(None)).await
}

async fn connect_with(addr: SocketAddr, config: ClientConfig) -> (WebSocketClient, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(64);
    let client = WebSocketClient::open(&format!("ws://{addr}/"), config, ChannelHandler::new(tx))
        .await
        .unwrap();
    (client, rx)
}

async fn next(rx: &mut mpsc::Receiver<Event>) -> Event {
    timeout(WAIT, rx.recv()).await.expect("timed out waiting for event").expect("channel closed")
}

async fn next_message(rx: &mut mpsc::Receiver<Event>) -> Message {
    match next(rx).await {
        Event::Message(m) => m,
        other => panic!("expected a message, got {other:?}"),
    }
}

// Events up to and including Closed
async fn until_closed(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = next(rx).await;
        let closed = matches!(event, Event::Closed(_));
        events.push(event);
        if closed {
            return events;
        }
    }
}

// Stands in for a server: answers one upgrade and sends `frames` in the same write as the 101,
// then hands back the socket so the test can read what the client sent
fn scripted_peer(frames: Vec<u8>) -> (SocketAddr, JoinHandle<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        let end = loop {
            if let Some(end) = handshake::find_header_end(&buf) {
                break end;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert_ne!(n, 0, "client hung up during handshake");
            buf.extend_from_slice(&chunk[..n]);
        };
        let hs = handshake::parse_request(&buf[..end]).unwrap();
        let mut reply = handshake::build_response(&hs.accept_key(), None).into_bytes();
        reply.extend_from_slice(&frames);
        stream.write_all(&reply).unwrap();
        stream
    });
    (addr, handle)
}

// Blocking upgrade over a plain socket, for sending frames the client engine never would
fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let key = handshake::generate_key();
    let request = handshake::build_request(&addr.to_string(), "/", &key, &[], &[]);
    stream.write_all(request.as_bytes()).unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    while handshake::find_header_end(&buf).is_none() {
        let n = stream.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "server hung up during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    handshake::parse_response(&buf, &key).unwrap();
    stream
}

fn read_frame(stream: &mut TcpStream, cursor: &mut FrameCursor) -> Frame {
    let mut chunk = [0u8; 256];
    loop {
        if let FrameState::Complete(frame) = cursor.next_frame().unwrap() {
            return frame;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "server hung up before sending a frame");
        cursor.push_bytes(&chunk[..n]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trip() {
    let (server, removed) = spawn_server();
    let (client, mut rx) = connect(server.local_addr()).await;
    assert_eq!(client.state(), State::Open);

    client.send_text("GET /ping").await.unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Text("200 OK\npong".into()));

    client.send_binary(&[1, 2, 3]).await.unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Binary(vec![1, 2, 3]));

    // fragmented in both directions
    let body = "x".repeat(100_000);
    client.send_text(&format!("POST /echo\n{body}")).await.unwrap();
    assert_eq!(next_message(&mut rx).await, Message::Text(format!("200 OK\n{body}")));

    client.send_text("PUT /ping").await.unwrap();
    assert_eq!(next_message(&mut rx).await.as_str(), Some("405 Method Not Allowed\n"));

    client.ping().await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Pong(Some(_))));
    assert!(client.latency().is_some());

    client.close().await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Closed(Some(CloseReason::Normal))));
    assert_eq!(client.state(), State::Closed);
    assert!(matches!(client.send_text("late").await, Err(Error::Closed)));

    let (_, reason) = removed.recv_timeout(WAIT).unwrap();
    assert_eq!(reason, Some(CloseReason::Normal));
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_sends_going_away() {
    let (server, _removed) = spawn_server();
    let (_client, mut rx) = connect(server.local_addr()).await;

    // the registry is filled in by an upgrade worker right after the 101 is written
    for _ in 0..50 {
        if server.connections() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.connections(), 1);

    tokio::task::spawn_blocking(move || server.shutdown()).await.unwrap();
    assert!(matches!(next(&mut rx).await, Event::Closed(Some(CloseReason::GoingAway))));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_handshake_is_an_error() {
    let (server, _removed) = spawn_server();
    let mut client = WebSocketClient::new(
        ClientConfig::default().with_header("Sec-WebSocket-Version", "8"),
        wust_engine::NoopHandler,
    );
    let err = client.connect(&format!("ws://{}/", server.local_addr())).await.unwrap_err();
    assert!(matches!(err, Error::Handshake(_)), "{err}");
    assert_eq!(client.state(), State::Disconnected);
}

#[test]
fn bad_version_gets_426() {
    let (server, _removed) = spawn_server();
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let request = "GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\
                   User-Agent: integration-test (long enough to pass the size check)\r\n\r\n";
    stream.write_all(request.as_bytes()).unwrap();

    let mut resp = String::new();
    stream.read_to_string(&mut resp).unwrap();
    assert!(resp.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "{resp}");
    assert!(resp.contains("Sec-WebSocket-Version: 13\r\n"));
}

#[test]
fn unmasked_client_frame_closes_with_1002() {
    let (server, removed) = spawn_server();
    let mut stream = raw_upgrade(server.local_addr());
    stream.write_all(&Frame::text("GET /ping").encode()).unwrap();

    let close = read_frame(&mut stream, &mut FrameCursor::new(1024));
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_code, 1002);
    let (_, reason) = removed.recv_timeout(WAIT).unwrap();
    assert_eq!(reason, Some(CloseReason::ProtoError));
}

#[test]
fn invalid_utf8_closes_with_1007() {
    let (server, _removed) = spawn_server();
    let mut stream = raw_upgrade(server.local_addr());
    let frame = Frame::new(Opcode::Text, vec![0xc3, 0x28]).with_mask([9, 8, 7, 6]);
    stream.write_all(&frame.encode()).unwrap();

    let close = read_frame(&mut stream, &mut FrameCursor::new(1024));
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_code, 1007);
}

#[test]
fn ping_between_fragments() {
    let (server, _removed) = spawn_server();
    let mut stream = raw_upgrade(server.local_addr());
    let key = [1, 2, 3, 4];
    let mut bytes = Frame::new(Opcode::Text, &b"GET /p"[..]).with_fin(false).with_mask(key).encode().to_vec();
    bytes.extend_from_slice(&Frame::ping(b"mid").with_mask(key).encode());
    bytes.extend_from_slice(&Frame::new(Opcode::Cont, &b"ing"[..]).with_mask(key).encode());
    stream.write_all(&bytes).unwrap();

    let mut cursor = FrameCursor::new(1024);
    let pong = read_frame(&mut stream, &mut cursor);
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(&pong.payload[..], b"mid");
    let reply = read_frame(&mut stream, &mut cursor);
    assert_eq!(&reply.payload[..], b"200 OK\npong");
}

#[tokio::test(flavor = "multi_thread")]
async fn client_closes_with_1007_on_invalid_utf8() {
    let (addr, peer) = scripted_peer(Frame::new(Opcode::Text, vec![0xFF, 0xFE]).encode().to_vec());
    let (client, mut rx) = connect(addr).await;
    let mut stream = peer.join().unwrap();

    let events = until_closed(&mut rx).await;
    assert!(
        matches!(
            &events[..],
            [Event::Error(e), Event::Closed(Some(CloseReason::DataError))] if e.contains("utf-8")
        ),
        "{events:?}"
    );
    let close = read_frame(&mut stream, &mut FrameCursor::new(1024));
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_code, 1007);
    assert!(close.is_masked());
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_answers_reserved_close_code_with_1002() {
    // 1005 must never be sent on the wire
    let (addr, peer) = scripted_peer(vec![0x88, 0x02, 0x03, 0xED]);
    let (_client, mut rx) = connect(addr).await;
    let mut stream = peer.join().unwrap();

    let events = until_closed(&mut rx).await;
    assert!(
        matches!(events.last(), Some(Event::Closed(Some(CloseReason::ProtoError)))),
        "{events:?}"
    );
    let close = read_frame(&mut stream, &mut FrameCursor::new(1024));
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_code, 1002);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_pongs_and_echoes_close() {
    let mut frames = Frame::ping(b"abc").encode().to_vec();
    frames.extend_from_slice(&Frame::close(CloseReason::Application(4001), "bye").encode());
    let (addr, peer) = scripted_peer(frames);
    let (client, mut rx) = connect(addr).await;
    let mut stream = peer.join().unwrap();

    let mut cursor = FrameCursor::new(1024);
    let pong = read_frame(&mut stream, &mut cursor);
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(&pong.payload[..], b"abc");
    let close = read_frame(&mut stream, &mut cursor);
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_code, 4001);

    let events = until_closed(&mut rx).await;
    assert!(
        matches!(&events[..], [Event::Closed(Some(CloseReason::Application(4001)))]),
        "{events:?}"
    );
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn close_gives_up_on_a_silent_peer() {
    let (addr, peer) = scripted_peer(Vec::new());
    let config = ClientConfig::default()
        .with_keepalive(None)
        .with_close_timeout(Duration::from_millis(200));
    let (client, mut rx) = connect_with(addr, config).await;
    let mut stream = peer.join().unwrap();

    let started = Instant::now();
    client.close().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.state(), State::Closed);
    assert!(matches!(next(&mut rx).await, Event::Closed(Some(CloseReason::Normal))));

    let mut cursor = FrameCursor::new(1024);
    let close = read_frame(&mut stream, &mut cursor);
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_code, 1000);
    // the transport is shut down without a reply
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}
