//! Integration tests for the coordinator: start/run/stop sequences,
//! channel admission, connection fan-out, and address book persistence.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use bitwire::channel::{Channel, ChannelOptions};
use bitwire::messages::{PeerAddress, Services};
use bitwire::wire::REGTEST_MAGIC;
use bitwire::{NetError, Network, Settings};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

static FILE_COUNTER: AtomicU32 = AtomicU32::new(0);

fn scratch_hosts_file() -> PathBuf {
    std::env::temp_dir().join(format!(
        "bitwire-net-{}-{}",
        std::process::id(),
        FILE_COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

/// A quiet regtest-flavored configuration: no listener, no dialer, no
/// seeds, so tests control every channel themselves.
fn test_settings(hosts_file: PathBuf) -> Settings {
    Settings {
        threads: 1,
        magic: REGTEST_MAGIC,
        inbound_port: 0,
        inbound_connections: 0,
        outbound_connections: 0,
        manual_attempt_limit: 1,
        connect_timeout_seconds: 2,
        hosts_file,
        seeds: Vec::new(),
        ..Settings::default()
    }
}

/// A loopback listener that accepts and holds connections open.
async fn accept_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

async fn dialed_channel(server: SocketAddr, notify: bool) -> std::sync::Arc<Channel> {
    let stream = TcpStream::connect(server).await.expect("connect");
    let mut options = ChannelOptions::new(REGTEST_MAGIC);
    options.notify = notify;
    Channel::new(stream, options)
}

#[tokio::test]
async fn start_is_refused_while_running_and_stop_is_idempotent() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));

    assert_eq!(network.start().await, Ok(()));
    assert_eq!(network.start().await, Err(NetError::OperationFailed));

    assert_eq!(network.stop().await, Ok(()));
    assert_eq!(network.stop().await, Ok(()));

    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn network_restarts_after_stop() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));

    assert_eq!(network.start().await, Ok(()));
    assert_eq!(network.stop().await, Ok(()));
    assert_eq!(network.start().await, Ok(()));
    assert_eq!(network.run().await, Ok(()));
    assert_eq!(network.stop().await, Ok(()));

    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn duplicate_admission_is_rejected_and_not_announced() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    network.start().await.expect("start");

    let (tx, mut rx) = mpsc::unbounded_channel();
    network
        .subscribe_connections(move |event| {
            let _ = tx.send(event.map(|channel| channel.authority()));
        })
        .expect("subscribe");

    let server = accept_server().await;
    let first = dialed_channel(server, true).await;
    let second = dialed_channel(server, true).await;
    assert_eq!(first.authority(), second.authority());

    assert_eq!(network.store_channel(first.clone()), Ok(()));
    assert_eq!(rx.try_recv(), Ok(Ok(server)));

    assert_eq!(
        network.store_channel(second.clone()),
        Err(NetError::AddressInUse)
    );
    assert!(rx.try_recv().is_err());
    assert_eq!(network.connected_count(), 1);
    assert!(network.connected(&server));

    network.stop().await.expect("stop");
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn unannounced_channels_are_stored_but_not_relayed() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    network.start().await.expect("start");

    let (tx, mut rx) = mpsc::unbounded_channel();
    network
        .subscribe_connections(move |event| {
            let _ = tx.send(event.map(|channel| channel.authority()));
        })
        .expect("subscribe");

    let server = accept_server().await;
    let seed_style = dialed_channel(server, false).await;
    assert_eq!(network.store_channel(seed_style), Ok(()));
    assert_eq!(network.connected_count(), 1);
    assert!(rx.try_recv().is_err());

    network.stop().await.expect("stop");
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn stop_delivers_one_terminal_to_connection_subscribers() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    network.start().await.expect("start");

    let (tx, mut rx) = mpsc::unbounded_channel();
    network
        .subscribe_connections(move |event| {
            let _ = tx.send(event.map(|channel| channel.authority()));
        })
        .expect("subscribe");

    network.stop().await.expect("stop");
    assert_eq!(rx.try_recv(), Ok(Err(NetError::ServiceStopped)));
    assert!(rx.try_recv().is_err());

    // Subscribing after stop is refused outright.
    assert_eq!(
        network.subscribe_connections(|_| {}),
        Err(NetError::ServiceStopped)
    );
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn stop_stops_every_registered_channel() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    network.start().await.expect("start");

    let server = accept_server().await;
    let channel = dialed_channel(server, true).await;
    network.store_channel(channel.clone()).expect("store");
    channel.start(|result| assert!(result.is_ok()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.subscribe_stop(move |code| {
        let _ = tx.send(code);
    });

    network.stop().await.expect("stop");

    let code = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timely stop")
        .expect("stop code");
    assert_eq!(code, NetError::ServiceStopped);
    assert!(channel.stopped());
    assert_eq!(network.connected_count(), 0);
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn manual_connect_admits_and_announces_a_channel() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    network.start().await.expect("start");

    let (tx, mut rx) = mpsc::unbounded_channel();
    network
        .subscribe_connections(move |event| {
            let _ = tx.send(event.map(|channel| channel.authority()));
        })
        .expect("subscribe");

    let server = accept_server().await;
    let channel = timeout(
        TEST_TIMEOUT,
        network.connect(&server.ip().to_string(), server.port()),
    )
    .await
    .expect("timely connect")
    .expect("connect");

    assert_eq!(channel.authority(), server);
    assert_eq!(network.connected_count(), 1);
    assert_eq!(rx.try_recv(), Ok(Ok(server)));

    network.stop().await.expect("stop");
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn manual_connect_honors_its_attempt_limit() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    network.start().await.expect("start");

    // Grab a port nothing listens on.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    };

    let result = timeout(
        TEST_TIMEOUT,
        network.connect(&dead.ip().to_string(), dead.port()),
    )
    .await
    .expect("timely failure");
    assert!(result.is_err());
    assert_eq!(network.connected_count(), 0);

    network.stop().await.expect("stop");
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn connect_after_stop_is_service_stopped() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    network.start().await.expect("start");
    network.stop().await.expect("stop");

    let result = network.connect("127.0.0.1", 1).await;
    assert!(matches!(result, Err(NetError::ServiceStopped)));
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn address_book_survives_stop_and_start() {
    let hosts_file = scratch_hosts_file();
    let address = PeerAddress {
        ip: "10.1.2.3".parse().expect("ip"),
        port: 8333,
        services: Services::NODE_NETWORK,
        timestamp: 1_700_000_000,
    };

    {
        let network = Network::new(test_settings(hosts_file.clone()));
        network.start().await.expect("start");
        network.store_address(address);
        assert_eq!(network.address_count(), 1);
        network.stop().await.expect("stop");
    }

    {
        let network = Network::new(test_settings(hosts_file.clone()));
        network.start().await.expect("start");
        assert_eq!(network.address_count(), 1);
        assert_eq!(network.fetch_address(), Ok(address));
        network.remove_address(&address.authority());
        assert_eq!(network.address_count(), 0);
        network.stop().await.expect("stop");
    }

    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn unreadable_hosts_file_fails_the_start_sequence() {
    let hosts_file = scratch_hosts_file();
    std::fs::write(&hosts_file, b"definitely not bincode").expect("write");

    let network = Network::new(test_settings(hosts_file.clone()));
    assert_eq!(network.start().await, Err(NetError::FileSystem));

    // The partially started coordinator still stops cleanly.
    assert_eq!(network.stop().await, Ok(()));
    let _ = std::fs::remove_file(hosts_file);
}

#[tokio::test]
async fn height_is_shared_state() {
    let hosts_file = scratch_hosts_file();
    let network = Network::new(test_settings(hosts_file.clone()));
    assert_eq!(network.height(), 0);
    network.set_height(840_000);
    assert_eq!(network.height(), 840_000);
    let _ = std::fs::remove_file(hosts_file);
}
