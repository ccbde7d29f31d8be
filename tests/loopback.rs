//! End-to-end tests: a server and a blocking client over loopback TCP.

use baseio::client::{BlockingClient, ClientError};
use baseio::config::{Config, RuntimeType};
use baseio::connection::ConnectionInfo;
use baseio::correlator::CorrelationTable;
use baseio::exchange::{Exchange, FrameKind, Message, ProtobaseExchange};
use baseio::protocols::{build_codec, ProtocolType};
use baseio::runtime::{self, mio::connect, EchoHandler, Handler};
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(runtime: RuntimeType, protocol: ProtocolType) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        workers: 2,
        runtime,
        protocol,
        buffer_count: 64,
        ..Config::default()
    }
}

fn start(config: &Config, handler: Arc<dyn Handler>) -> runtime::Server {
    let codec = build_codec(config.protocol, config.limits());
    runtime::start(config, codec, handler).unwrap()
}

fn client(
    config: &Config,
    server: &runtime::Server,
) -> BlockingClient<baseio::runtime::mio::ClientConnection> {
    let table = Arc::new(CorrelationTable::new());
    let codec = build_codec(config.protocol, config.limits());
    let conn = connect(server.local_addr(), config, codec, Arc::clone(&table) as Arc<dyn Handler>)
        .unwrap();
    BlockingClient::new(conn, table)
}

#[test]
fn test_protobase_request_response() {
    for runtime in [RuntimeType::Mio, RuntimeType::Tokio] {
        let config = config(runtime, ProtocolType::Protobase);
        let server = start(&config, Arc::new(EchoHandler));
        let client = client(&config, &server);

        for i in 0..10 {
            let mut request = ProtobaseExchange::request("echo", &format!("hello {i}"));
            request.write_binary(&[i as u8, 0xFF]);

            let response = client
                .request(Exchange::Protobase(request), Duration::from_secs(5))
                .unwrap();
            let p = response.as_protobase().unwrap();
            assert_eq!(p.name(), Some("echo"));
            assert_eq!(p.read_text(), format!("hello {i}"));
            assert_eq!(p.read_binary(), &[i as u8, 0xFF]);
        }

        server.shutdown();
        server.join();
    }
}

#[test]
fn test_websocket_sole_request() {
    let config = config(RuntimeType::Mio, ProtocolType::WebSocket);
    let server = start(&config, Arc::new(EchoHandler));
    let client = client(&config, &server);

    let mut msg = Message::new(FrameKind::Text);
    msg.payload_mut().write_bytes(b"Hello");
    let response = client
        .request(Exchange::Frame(msg), Duration::from_secs(5))
        .unwrap();

    let msg = response.as_message().unwrap();
    assert_eq!(msg.kind(), Some(FrameKind::Text));
    assert_eq!(msg.payload().read_text(), Some("Hello"));

    server.shutdown();
    server.join();
}

#[test]
fn test_unanswered_request_times_out() {
    let config = config(RuntimeType::Mio, ProtocolType::Protobase);
    let silent = |_: &ConnectionInfo, _: Exchange| -> Option<Exchange> { None };
    let server = start(&config, Arc::new(silent));
    let client = client(&config, &server);

    let started = Instant::now();
    let request = ProtobaseExchange::request("void", "anyone?");
    match client.request(Exchange::Protobase(request), Duration::from_millis(100)) {
        Err(ClientError::Timeout(waited)) => assert!(waited >= Duration::from_millis(100)),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));

    server.shutdown();
    server.join();
}

#[test]
fn test_heartbeat_never_reaches_handler() {
    let mut config = config(RuntimeType::Mio, ProtocolType::FixedLength);
    config.heartbeat_ms = 10;
    let refuse = |conn: &ConnectionInfo, ex: Exchange| -> Option<Exchange> {
        assert!(!matches!(
            ex.frame_kind(),
            Some(FrameKind::Ping) | Some(FrameKind::Pong)
        ));
        EchoHandler.accept(conn, ex)
    };
    let server = start(&config, Arc::new(refuse));
    let client = client(&config, &server);

    // let a few idle pings and pongs cross the connection
    std::thread::sleep(Duration::from_millis(60));

    let mut msg = Message::new(FrameKind::Binary);
    msg.payload_mut().write_bytes(b"after heartbeats");
    let response = client
        .request(Exchange::Text(msg), Duration::from_secs(5))
        .unwrap();
    assert_eq!(
        response.as_message().unwrap().payload().read(),
        b"after heartbeats"
    );

    server.shutdown();
    server.join();
}

#[test]
fn test_encode_failure_keeps_connection() {
    let config = config(RuntimeType::Mio, ProtocolType::WebSocket);
    let server = start(&config, Arc::new(EchoHandler));
    let client = client(&config, &server);

    // text-line exchanges are not websocket frames
    let started = Instant::now();
    let request = Exchange::Text(Message::text("wrong family"));
    match client.request(request, Duration::from_secs(5)) {
        Err(ClientError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!client.session().is_closed());

    let response = client
        .request(Exchange::Frame(Message::text("still open")), Duration::from_secs(5))
        .unwrap();
    assert_eq!(
        response.as_message().unwrap().payload().read_text(),
        Some("still open")
    );

    server.shutdown();
    server.join();
}

#[test]
fn test_pending_request_fails_when_connection_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let config = config(RuntimeType::Mio, ProtocolType::Protobase);
    let table = Arc::new(CorrelationTable::new());
    let codec = build_codec(config.protocol, config.limits());
    let conn = connect(
        listener.local_addr().unwrap(),
        &config,
        codec,
        Arc::clone(&table) as Arc<dyn Handler>,
    )
    .unwrap();
    let client = BlockingClient::new(conn, table);

    let (peer, _) = listener.accept().unwrap();
    let dropper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        drop(peer);
    });

    let started = Instant::now();
    let request = ProtobaseExchange::request("void", "hello?");
    match client.request(Exchange::Protobase(request), Duration::from_secs(10)) {
        Err(ClientError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotConnected),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    dropper.join().unwrap();
}
