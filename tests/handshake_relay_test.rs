// tests/handshake_relay_test.rs

//! End-to-end fidelity check for the Pre-Login handshake relay (the pack's
//! S5 scenario): a fake client splits one TDS message across several
//! packets, a fake backend echoes back its own differently-framed reply,
//! and both sides must see exactly the bytes and packet boundaries the
//! other side produced.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tds_admission_proxy::admission::AdmissionQueue;
use tds_admission_proxy::config::{BucketConfig, Config, FallbackConfig, ProxyConfig, StoreConfig};
use tds_admission_proxy::connection::handle_connection;
use tds_admission_proxy::coordinator::Coordinator;
use tds_admission_proxy::server::context::ServerState;
use tds_admission_proxy::tds::framing::{self, PacketType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

fn test_config(backend_port: u16) -> Config {
    Config {
        proxy: ProxyConfig {
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            instance_id: Some("relay-test-replica".into()),
            session_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(5),
            max_queue_size: 10,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            fallback: FallbackConfig {
                enabled: true,
                local_limit_divisor: 1,
            },
            // Unreachable on purpose: forces the coordinator straight into
            // fallback mode so this test needs no real shared store.
            store: StoreConfig {
                url: "redis://127.0.0.1:1".into(),
            },
        },
        buckets: vec![BucketConfig {
            id: "primary".into(),
            host: "127.0.0.1".into(),
            port: backend_port,
            max: 5,
            queue_timeout: None,
            connection_timeout: None,
            min_idle: 0,
            max_idle_time: None,
        }],
    }
}

#[tokio::test]
async fn prelogin_handshake_is_relayed_byte_and_frame_identical() {
    // Fake backend: reads one message, replies with its own packet framing.
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend_listener.local_addr().unwrap().port();
    let backend_reply_payload: Vec<u8> = (0..500u32).map(|i| (i % 200) as u8).collect();
    let expected_reply = backend_reply_payload.clone();

    tokio::spawn(async move {
        let (mut backend_conn, _) = backend_listener.accept().await.unwrap();
        let received = framing::read_message(&mut backend_conn).await.unwrap();
        assert_eq!(received.packet_type, PacketType::PRE_LOGIN);

        let reply_packets =
            framing::build_packets(PacketType::TABULAR_RESULT, &backend_reply_payload, 128);
        framing::write_packets(&mut backend_conn, &reply_packets)
            .await
            .unwrap();
        // Keep the connection open briefly so the splice phase has something
        // to relay before the proxy session tears down.
        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    let config = Arc::new(test_config(backend_port));
    let coordinator = Coordinator::connect(config.clone()).await.unwrap();
    assert!(coordinator.is_fallback(), "store is unreachable on purpose");
    let admission = AdmissionQueue::new(config.clone(), coordinator.clone());
    let state = Arc::new(ServerState {
        config: config.clone(),
        coordinator,
        admission,
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy_listener.local_addr().unwrap().port();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let (socket, addr) = proxy_listener.accept().await.unwrap();
        handle_connection(socket, addr, state, 1, shutdown_rx).await;
    });

    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

    // Client sends one Pre-Login message split across three small packets.
    let client_payload: Vec<u8> = (0..37u8).collect();
    let client_packets = framing::build_packets(PacketType::PRE_LOGIN, &client_payload, 16);
    assert!(client_packets.len() >= 3, "payload should span several packets");
    framing::write_packets(&mut client, &client_packets)
        .await
        .unwrap();

    let reply = framing::read_message(&mut client).await.unwrap();
    assert_eq!(reply.packet_type, PacketType::TABULAR_RESULT);
    assert_eq!(reply.payload.as_ref(), expected_reply.as_slice());

    // The client must see the exact packet boundaries the backend produced,
    // not a re-framing of them.
    let expected_packets: Vec<Bytes> =
        framing::build_packets(PacketType::TABULAR_RESULT, &expected_reply, 128);
    assert_eq!(reply.raw_packets, expected_packets);
}

#[tokio::test]
async fn non_prelogin_first_message_is_rejected_with_connection_close() {
    let config = Arc::new(test_config(1));
    let coordinator = Coordinator::connect(config.clone()).await.unwrap();
    let admission = AdmissionQueue::new(config.clone(), coordinator.clone());
    let state = Arc::new(ServerState {
        config: config.clone(),
        coordinator,
        admission,
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy_listener.local_addr().unwrap().port();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let (socket, addr) = proxy_listener.accept().await.unwrap();
        handle_connection(socket, addr, state, 2, shutdown_rx).await;
    });

    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    // SQL Batch (0x01) instead of Pre-Login (0x12): the handler must refuse
    // to proceed and close the connection rather than treat it as a handshake.
    let packets = framing::build_packets(PacketType::SQL_BATCH, b"not a handshake", 4096);
    framing::write_packets(&mut client, &packets).await.unwrap();

    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "proxy must close the connection without relaying anything");
}
