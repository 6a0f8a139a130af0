//! Connection lifecycle against scripted peers: the claim-before-dial guard
//! on connect, read-error detection and tick-driven reconnection.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitcoin::{
    consensus::{Decodable, Encodable},
    p2p::{
        Address, Magic, ServiceFlags,
        message::{NetworkMessage, RawNetworkMessage},
        message_network::VersionMessage,
    },
};
use minuet::{
    Error,
    storage::Store,
    sync::{Config, Network, NodeConfig, session::Session},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

const MAGIC: Magic = Magic::REGTEST;

async fn read_peer_message(stream: &mut TcpStream) -> Option<RawNetworkMessage> {
    let mut envelope = [0u8; 24];
    stream.read_exact(&mut envelope).await.ok()?;

    let payload_len = u32::from_le_bytes(envelope[16..20].try_into().unwrap());

    let mut payload = vec![0u8; payload_len as usize];
    stream.read_exact(&mut payload).await.ok()?;

    let framed = [envelope.to_vec(), payload].concat();
    Some(RawNetworkMessage::consensus_decode(&mut &framed[..]).unwrap())
}

async fn send_peer_message(stream: &mut TcpStream, message: NetworkMessage) {
    let mut buf = vec![];
    RawNetworkMessage::new(MAGIC, message)
        .consensus_encode(&mut buf)
        .unwrap();
    stream.write_all(&buf).await.unwrap();
}

fn peer_version() -> NetworkMessage {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let services = ServiceFlags::NETWORK | ServiceFlags::WITNESS;

    NetworkMessage::Version(VersionMessage {
        version: 70016,
        services,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64,
        receiver: Address::new(&addr, ServiceFlags::NONE),
        sender: Address::new(&addr, services),
        nonce: 1,
        user_agent: "/scripted-peer:0.1.0/".into(),
        start_height: 0,
        relay: false,
    })
}

/// Accepts connections forever, counting them. Every connection gets a
/// handshake and further messages are ignored; with `drop_first` set, the
/// first connection is hung up right after the handshake.
async fn accepting_peer(listener: TcpListener, accepts: Arc<AtomicUsize>, drop_first: bool) {
    loop {
        let (mut stream, _) = listener.accept().await.unwrap();
        let ordinal = accepts.fetch_add(1, Ordering::SeqCst) + 1;
        let hang_up = drop_first && ordinal == 1;

        tokio::spawn(async move {
            while let Some(message) = read_peer_message(&mut stream).await {
                if let NetworkMessage::Version(_) = message.payload() {
                    send_peer_message(&mut stream, peer_version()).await;
                    send_peer_message(&mut stream, NetworkMessage::Verack).await;

                    if hang_up {
                        return;
                    }
                }
            }
        });
    }
}

fn session_config(peer_address: String) -> Config {
    Config {
        node: NodeConfig { p2p_address: peer_address },
        network: Network::Regtest,
        checkpoint: None,
        tick_interval_secs: Some(1),
    }
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never reached");
}

#[tokio::test]
async fn concurrent_connects_share_a_single_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_address = listener.local_addr().unwrap().to_string();

    let accepts = Arc::new(AtomicUsize::new(0));
    let peer = tokio::spawn(accepting_peer(listener, accepts.clone(), false));

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let session = Arc::new(Session::new(session_config(peer_address), store).unwrap());

    let (first, second) = tokio::join!(session.connect(), session.connect());

    // one call wins the link slot, the other fails before dialing
    let (winner, loser) = if first.is_ok() {
        (first, second)
    } else {
        (second, first)
    };
    assert!(winner.is_ok());
    assert!(matches!(loser.unwrap_err(), Error::AlreadyConnected));

    assert!(session.is_connected());
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    session.stop();
    peer.abort();
}

#[tokio::test]
async fn read_error_disconnects_and_a_tick_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_address = listener.local_addr().unwrap().to_string();

    let accepts = Arc::new(AtomicUsize::new(0));
    let peer = tokio::spawn(accepting_peer(listener, accepts.clone(), true));

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let session = Arc::new(Session::new(session_config(peer_address), store).unwrap());

    session.start().await;

    // the peer hangs up right after the handshake
    wait_for(|| !session.is_connected()).await;

    // a subsequent tick performs one reconnect
    wait_for(|| session.is_connected()).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 2);

    // and once connected, later ticks dial nothing further
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(session.is_connected());
    assert_eq!(accepts.load(Ordering::SeqCst), 2);

    session.stop();
    peer.abort();
}
