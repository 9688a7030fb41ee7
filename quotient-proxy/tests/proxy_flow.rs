//! End-to-end proxy tests against a scripted backend.
//!
//! A fake MySQL server greets, authenticates and answers every command
//! with OK while recording the statements it receives; a fake client
//! drives the proxy over a real socket. This exercises the full path:
//! listener, session state machine, rewrite pipeline, pool and breaker.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use quotient_protocol::commands::COM_QUERY;
use quotient_protocol::packet::{read_packet, write_packet};
use quotient_protocol::payload;
use quotient_proxy::pool::{BackendPool, PoolConfig};
use quotient_proxy::server::ProxyServer;
use quotient_shared::config::{
    BreakerSettings, ColumnRule, ConfigStore, ConversionSnapshot, TableRule,
};
use quotient_shared::metrics::NoopSink;
use quotient_shared::rounding::RoundingMode;

fn ok_payload() -> Vec<u8> {
    vec![payload::OK_HEADER, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

fn greeting_payload() -> Vec<u8> {
    let mut p = vec![0x0A];
    p.extend_from_slice(b"8.0.30-quotient\0");
    p.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    p.extend_from_slice(b"salt5678\0");
    p
}

fn handshake_response_payload() -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&payload::CLIENT_PROTOCOL_41.to_le_bytes());
    p.extend_from_slice(&[0x00; 28]);
    p.extend_from_slice(b"app_user\0");
    p
}

/// Scripted backend: greet, accept auth, OK every command, record
/// COM_QUERY texts.
async fn start_fake_backend() -> (String, mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                write_packet(&mut socket, 0, &greeting_payload())
                    .await
                    .unwrap();
                let _auth = read_packet(&mut socket).await.unwrap();
                write_packet(&mut socket, 2, &ok_payload()).await.unwrap();

                loop {
                    let Ok(command) = read_packet(&mut socket).await else {
                        return;
                    };
                    if command.payload.is_empty() {
                        return;
                    }
                    match command.payload[0] {
                        COM_QUERY => {
                            let text =
                                String::from_utf8_lossy(&command.payload[1..]).into_owned();
                            let _ = tx.send(text);
                            write_packet(&mut socket, 1, &ok_payload()).await.unwrap();
                        }
                        0x01 => return, // COM_QUIT
                        _ => {
                            write_packet(&mut socket, 1, &ok_payload()).await.unwrap();
                        }
                    }
                }
            });
        }
    });

    (addr, rx, task)
}

fn snapshot() -> ConversionSnapshot {
    ConversionSnapshot {
        ratio: 1000,
        precision: 4,
        rounding_mode: RoundingMode::Bankers,
        tables: HashMap::from([(
            "orders".to_string(),
            TableRule {
                enabled: true,
                columns: HashMap::from([
                    (
                        "total_amount".to_string(),
                        ColumnRule {
                            target_column: "total_amount_idn".to_string(),
                            precision: None,
                            rounding_mode: None,
                        },
                    ),
                    (
                        "shipping_fee".to_string(),
                        ColumnRule {
                            target_column: "shipping_fee_idn".to_string(),
                            precision: None,
                            rounding_mode: None,
                        },
                    ),
                ]),
            },
        )]),
    }
}

async fn start_proxy(
    backend_addr: &str,
) -> (String, Arc<ConfigStore>, watch::Sender<bool>, JoinHandle<()>) {
    let store = Arc::new(ConfigStore::new(snapshot()).unwrap());
    let metrics = Arc::new(NoopSink);
    let pool = BackendPool::new(
        PoolConfig {
            backend_addr: backend_addr.to_string(),
            max_size: 8,
            max_idle: 8,
            connect_timeout: std::time::Duration::from_millis(500),
            acquire_timeout: std::time::Duration::from_millis(500),
            max_idle_time: std::time::Duration::from_secs(300),
            max_age: std::time::Duration::from_secs(1800),
            reap_interval: std::time::Duration::from_secs(30),
        },
        &BreakerSettings {
            max_failures: 2,
            cooldown_ms: 60_000,
            max_probes: 2,
        },
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(
        "127.0.0.1:0",
        16,
        pool,
        Arc::clone(&store),
        metrics,
        shutdown_rx,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, store, shutdown_tx, task)
}

/// Connect and complete the relayed handshake + auth exchange.
async fn connect_client(proxy_addr: &str) -> TcpStream {
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let greeting = read_packet(&mut client).await.unwrap();
    assert_eq!(greeting.payload[0], 0x0A);

    write_packet(&mut client, 1, &handshake_response_payload())
        .await
        .unwrap();
    let verdict = read_packet(&mut client).await.unwrap();
    assert!(payload::is_ok(&verdict.payload));

    client
}

async fn send_query(client: &mut TcpStream, text: &str) {
    let mut packet = Vec::with_capacity(1 + text.len());
    packet.push(COM_QUERY);
    packet.extend_from_slice(text.as_bytes());
    write_packet(client, 0, &packet).await.unwrap();
    let reply = read_packet(client).await.unwrap();
    assert!(payload::is_ok(&reply.payload));
}

#[tokio::test]
async fn test_insert_is_rewritten_on_the_wire() {
    let (backend_addr, mut queries, _backend) = start_fake_backend().await;
    let (proxy_addr, _store, _shutdown, _server) = start_proxy(&backend_addr).await;

    let mut client = connect_client(&proxy_addr).await;
    send_query(
        &mut client,
        "INSERT INTO orders (customer_id, total_amount, shipping_fee) VALUES (123, 500000, 25000)",
    )
    .await;

    let seen = queries.recv().await.unwrap();
    assert_eq!(
        seen,
        "INSERT INTO orders (customer_id, total_amount, shipping_fee, total_amount_idn, shipping_fee_idn) VALUES (123, 500000, 25000, 500.0000, 25.0000)"
    );
}

#[tokio::test]
async fn test_update_is_rewritten_on_the_wire() {
    let (backend_addr, mut queries, _backend) = start_fake_backend().await;
    let (proxy_addr, _store, _shutdown, _server) = start_proxy(&backend_addr).await;

    let mut client = connect_client(&proxy_addr).await;
    send_query(&mut client, "UPDATE orders SET total_amount = 750000 WHERE id = 123").await;

    let seen = queries.recv().await.unwrap();
    assert_eq!(
        seen,
        "UPDATE orders SET total_amount = 750000, total_amount_idn = 750.0000 WHERE id = 123"
    );
}

#[tokio::test]
async fn test_select_passes_through_untouched() {
    let (backend_addr, mut queries, _backend) = start_fake_backend().await;
    let (proxy_addr, _store, _shutdown, _server) = start_proxy(&backend_addr).await;

    let mut client = connect_client(&proxy_addr).await;
    let statement = "SELECT * FROM orders WHERE id = 1";
    send_query(&mut client, statement).await;

    assert_eq!(queries.recv().await.unwrap(), statement);
}

#[tokio::test]
async fn test_commands_arrive_in_order() {
    let (backend_addr, mut queries, _backend) = start_fake_backend().await;
    let (proxy_addr, _store, _shutdown, _server) = start_proxy(&backend_addr).await;

    let mut client = connect_client(&proxy_addr).await;
    for i in 0..20 {
        send_query(&mut client, &format!("SELECT {i}")).await;
    }
    for i in 0..20 {
        assert_eq!(queries.recv().await.unwrap(), format!("SELECT {i}"));
    }
}

#[tokio::test]
async fn test_transaction_statements_pass_through() {
    let (backend_addr, mut queries, _backend) = start_fake_backend().await;
    let (proxy_addr, _store, _shutdown, _server) = start_proxy(&backend_addr).await;

    let mut client = connect_client(&proxy_addr).await;
    for statement in ["BEGIN", "UPDATE orders SET total_amount = 1000 WHERE id = 1", "COMMIT"] {
        send_query(&mut client, statement).await;
    }

    assert_eq!(queries.recv().await.unwrap(), "BEGIN");
    assert_eq!(
        queries.recv().await.unwrap(),
        "UPDATE orders SET total_amount = 1000, total_amount_idn = 1.0000 WHERE id = 1"
    );
    assert_eq!(queries.recv().await.unwrap(), "COMMIT");
}

#[tokio::test]
async fn test_quit_closes_cleanly() {
    let (backend_addr, _queries, _backend) = start_fake_backend().await;
    let (proxy_addr, _store, _shutdown, _server) = start_proxy(&backend_addr).await;

    let mut client = connect_client(&proxy_addr).await;
    write_packet(&mut client, 0, &[0x01]).await.unwrap();

    // The proxy closes the client socket without a reply.
    let end = read_packet(&mut client).await;
    assert!(end.is_err());
}

#[tokio::test]
async fn test_backend_down_yields_err_packet() {
    // No backend at this address: dials fail and, after the threshold,
    // the breaker rejects outright.
    let (proxy_addr, _store, _shutdown, _server) = start_proxy("127.0.0.1:1").await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
        let packet = read_packet(&mut client).await.unwrap();
        assert!(payload::is_err(&packet.payload));
    }

    // By now the circuit is open and the message says so.
    let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
    let packet = read_packet(&mut client).await.unwrap();
    let err = payload::ErrPayload::parse(&packet.payload).unwrap();
    assert!(err.message.contains("circuit breaker open"), "{}", err.message);
}

#[tokio::test]
async fn test_config_reload_applies_to_live_session() {
    let (backend_addr, mut queries, _backend) = start_fake_backend().await;
    let (proxy_addr, store, _shutdown, _server) = start_proxy(&backend_addr).await;

    let mut client = connect_client(&proxy_addr).await;
    send_query(&mut client, "UPDATE orders SET total_amount = 1000 WHERE id = 1").await;
    assert_eq!(
        queries.recv().await.unwrap(),
        "UPDATE orders SET total_amount = 1000, total_amount_idn = 1.0000 WHERE id = 1"
    );

    // Disable the table mid-session; the next statement on the same
    // connection passes through untouched.
    let mut next = snapshot();
    next.tables.get_mut("orders").unwrap().enabled = false;
    store.install(next).unwrap();

    let statement = "UPDATE orders SET total_amount = 2000 WHERE id = 1";
    send_query(&mut client, statement).await;
    assert_eq!(queries.recv().await.unwrap(), statement);

    // Re-enable with a different precision and watch it take effect.
    let mut next = snapshot();
    next.precision = 2;
    store.install(next).unwrap();

    send_query(&mut client, "UPDATE orders SET total_amount = 3000 WHERE id = 1").await;
    assert_eq!(
        queries.recv().await.unwrap(),
        "UPDATE orders SET total_amount = 3000, total_amount_idn = 3.00 WHERE id = 1"
    );
}
