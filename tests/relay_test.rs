//! Tests for the duplex relay

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use portbridge::{DataHook, Direction, Relay, Status};

/// Open a loopback connection and return both ends.
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr).await.unwrap();
    let (accept, _) = listener.accept().await.unwrap();
    (connect, accept)
}

/// Build a relay wired between a client stream and a target stream.
async fn relay_setup() -> (TcpStream, Arc<Relay>, TcpStream) {
    let (client, relay_inbound) = tcp_pair().await;
    let (relay_outbound, target) = tcp_pair().await;
    let relay = Arc::new(Relay::new(relay_inbound, relay_outbound));
    (client, relay, target)
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read until EOF or connection reset, asserting no more data arrives.
async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("timed out waiting for EOF")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected EOF, got {} bytes", n);
}

#[tokio::test]
async fn test_forwards_both_directions() {
    let (mut client, relay, mut target) = relay_setup().await;

    assert_eq!(relay.status(), Status::Closed);
    Arc::clone(&relay).run();
    assert_eq!(relay.status(), Status::Running);

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    target.write_all(b"world").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    relay.close();
    assert_eq!(relay.status(), Status::Closed);
}

#[tokio::test]
async fn test_close_callback_fires_exactly_once() {
    let (client, relay, target) = relay_setup().await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    relay.set_close_hook(Arc::new(move |_relay| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    Arc::clone(&relay).run();

    // Both pumps fail at once while external closers race them.
    drop(client);
    drop(target);
    let mut closers = Vec::new();
    for _ in 0..8 {
        let relay = Arc::clone(&relay);
        closers.push(tokio::spawn(async move {
            relay.close();
        }));
    }
    for closer in closers {
        closer.await.unwrap();
    }

    wait_until(|| relay.status() == Status::Closed, "relay to close").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_data_hook_transforms_chunks() {
    let (mut client, relay, mut target) = relay_setup().await;

    let hook: DataHook = Arc::new(|_relay, _from, data| Bytes::from(data.to_ascii_uppercase()));
    relay.set_data_hook(hook);
    Arc::clone(&relay).run();

    client.write_all(b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ABC");
}

#[tokio::test]
async fn test_empty_hook_result_drops_chunk() {
    let (mut client, relay, mut target) = relay_setup().await;

    let hook: DataHook = Arc::new(|_relay, _from, data| {
        if data == b"drop" {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(data)
        }
    });
    relay.set_data_hook(hook);
    Arc::clone(&relay).run();

    client.write_all(b"drop").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.write_all(b"keep").await.unwrap();

    let mut buf = [0u8; 4];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"keep");
}

#[tokio::test]
async fn test_hook_setters_ignored_while_running() {
    let (mut client, relay, mut target) = relay_setup().await;

    Arc::clone(&relay).run();

    // Too late: the relay is already running, so the hook must not apply.
    let hook: DataHook = Arc::new(|_relay, _from, data| Bytes::from(data.to_ascii_uppercase()));
    relay.set_data_hook(hook);

    client.write_all(b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"abc");
}

#[tokio::test]
async fn test_peer_eof_closes_both_endpoints() {
    let (client, relay, mut target) = relay_setup().await;

    Arc::clone(&relay).run();
    drop(client);

    expect_eof(&mut target).await;
    wait_until(|| relay.status() == Status::Closed, "relay to close").await;
}

#[tokio::test]
async fn test_no_forwarding_after_close() {
    let (mut client, relay, mut target) = relay_setup().await;

    Arc::clone(&relay).run();

    client.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"before");

    relay.close();

    // Writes after close never reach the other side; the client instead
    // observes its endpoint going away.
    let _ = client.write_all(b"after").await;
    expect_eof(&mut target).await;
}

#[tokio::test]
async fn test_run_consumed_after_close() {
    let (_client, relay, _target) = relay_setup().await;

    Arc::clone(&relay).run();
    relay.close();
    assert_eq!(relay.status(), Status::Closed);

    // A closed relay cannot be restarted.
    Arc::clone(&relay).run();
    assert_eq!(relay.status(), Status::Closed);
}

#[tokio::test]
async fn test_close_before_run_is_noop() {
    let (mut client, relay, mut target) = relay_setup().await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    relay.set_close_hook(Arc::new(move |_relay| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    relay.close();
    assert_eq!(relay.status(), Status::Closed);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // The relay was never running, so it can still start normally.
    Arc::clone(&relay).run();
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
}

#[tokio::test]
async fn test_byte_counters_track_forwarded_data() {
    let (mut client, relay, mut target) = relay_setup().await;

    Arc::clone(&relay).run();

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    target.read_exact(&mut buf).await.unwrap();

    assert_eq!(relay.bytes_forwarded(Direction::Inbound), 5);
    assert_eq!(relay.bytes_forwarded(Direction::Outbound), 0);

    target.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();

    assert_eq!(relay.bytes_forwarded(Direction::Outbound), 2);
    assert_eq!(relay.total_bytes(), 7);
}

#[tokio::test]
async fn test_endpoint_addresses_exposed() {
    let (client, relay, target) = relay_setup().await;

    assert_eq!(relay.inbound_addr(), Some(client.local_addr().unwrap()));
    assert_eq!(relay.outbound_addr(), Some(target.local_addr().unwrap()));
}
