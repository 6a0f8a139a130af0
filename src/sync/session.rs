use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitcoin::{
    Block, Transaction, VarInt,
    consensus::{Decodable, Encodable, ReadExt, encode},
    io,
    p2p::{
        Address, Magic, ServiceFlags,
        message::{CommandString, NetworkMessage, RawNetworkMessage},
        message_blockdata::Inventory,
        message_network::VersionMessage,
    },
    secp256k1::{self, rand::Rng},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tracing::{error, info, trace, warn};

use crate::{
    error::Error,
    storage::Store,
    sync::{Checkpoint, Config, Network, TransactionScanner},
};

const VERSION: u32 = 70016;
const USER_AGENT: &str = "/minuet:0.1.0/";
const SERVICES: ServiceFlags = ServiceFlags::NONE;

const DEFAULT_TICK_SECS: u64 = 3;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/*
    Peer Session

    Owns the single connection to the node: a writer task draining the
    outbound queue in FIFO order, a reader task dispatching framed inbound
    messages, and a process-lifetime timer that is the sole retry mechanism.
    The header/block sync engines live in the sibling modules as further impl
    blocks on Session; all sync state is mutated on the reader task's
    dispatch path.
*/

/// Inbound messages the session reacts to. Anything else decodes to
/// `Unknown` and is ignored, so an unrecognized command never kills the
/// connection.
#[derive(Debug)]
pub(crate) enum Inbound {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    Headers(Vec<bitcoin::block::Header>),
    Block(Block),
    Addr(Vec<(u32, Address)>),
    Unknown(CommandString),
}

impl Decodable for Inbound {
    fn consensus_decode<D: io::Read + ?Sized>(d: &mut D) -> Result<Self, encode::Error> {
        let _magic: Magic = Decodable::consensus_decode(d)?;

        let command = CommandString::consensus_decode(d)?;

        let len = u32::consensus_decode(d)?;
        let _checksum = <[u8; 4]>::consensus_decode(d)?;

        let mut payload = vec![0u8; len as usize];
        d.read_slice(&mut payload)?;
        let payload = &mut &payload[..];

        let message = match command.as_ref() {
            "version" => Inbound::Version(Decodable::consensus_decode(payload)?),
            "verack" => Inbound::Verack,
            "ping" => Inbound::Ping(Decodable::consensus_decode(payload)?),
            "inv" => Inbound::Inv(Decodable::consensus_decode(payload)?),
            "getdata" => Inbound::GetData(Decodable::consensus_decode(payload)?),
            "headers" => Inbound::Headers({
                let len = VarInt::consensus_decode(payload)?.0 as usize;
                let mut headers = Vec::with_capacity(len);

                for _ in 0..len {
                    headers.push(Decodable::consensus_decode(payload)?);
                    // trailing tx count, always zero in a headers message
                    let _: VarInt = Decodable::consensus_decode(payload)?;
                }

                headers
            }),
            "block" => Inbound::Block(Block::consensus_decode_from_finite_reader(payload)?),
            "addr" => Inbound::Addr(Decodable::consensus_decode(payload)?),
            _ => Inbound::Unknown(command),
        };

        Ok(message)
    }
}

fn version_message() -> NetworkMessage {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0);

    let services = SERVICES;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time error")
        .as_secs() as i64;

    NetworkMessage::Version(VersionMessage {
        version: VERSION,
        services,
        timestamp,
        receiver: Address::new(&addr, services),
        sender: Address::new(&addr, services),
        nonce: secp256k1::rand::thread_rng().r#gen::<u64>(),
        user_agent: USER_AGENT.into(),
        start_height: 0,
        relay: false,
    })
}

/// Sticky status bits shared between the reader task (which raises them) and
/// the timer task (which consumes each with a single atomic swap per tick,
/// immediately before re-issuing the corresponding resync).
#[derive(Default)]
pub(crate) struct SyncFlags {
    pub(crate) inv_seen: AtomicBool,
    pub(crate) header_error: AtomicBool,
    pub(crate) block_error: AtomicBool,
    pub(crate) fork_detected: AtomicBool,
}

struct PeerLink {
    outbound: mpsc::UnboundedSender<NetworkMessage>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

pub(crate) struct RegisteredScanner {
    pub(crate) id: String,
    pub(crate) scanner: Arc<dyn TransactionScanner>,
}

pub struct Session {
    pub(crate) network: Network,
    pub(crate) checkpoint: Checkpoint,
    peer_address: String,
    tick_interval: Duration,
    pub(crate) store: Arc<Store>,
    pub(crate) scanners: Vec<RegisteredScanner>,
    pub(crate) check_height: AtomicU64,
    pub(crate) flags: SyncFlags,
    link: Mutex<Option<PeerLink>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Builds a session around the given store, recovering the sync cursor
    /// (defaulting to the checkpoint height on a fresh store).
    pub fn new(config: Config, store: Arc<Store>) -> Result<Self, Error> {
        let checkpoint = config.checkpoint()?;
        let check_height = store.cursor()?.unwrap_or(checkpoint.height);

        info!(height = check_height, "recovered sync cursor");

        Ok(Self {
            network: config.network,
            checkpoint,
            peer_address: config.node.p2p_address,
            tick_interval: Duration::from_secs(
                config.tick_interval_secs.unwrap_or(DEFAULT_TICK_SECS),
            ),
            store,
            scanners: Vec::new(),
            check_height: AtomicU64::new(check_height),
            flags: SyncFlags::default(),
            link: Mutex::new(None),
            timer: Mutex::new(None),
        })
    }

    /// Registers a transaction scanner under an explicit id. Registration
    /// happens before `start`; reusing an id is a configuration error.
    pub fn register_scanner(
        &mut self,
        id: impl Into<String>,
        scanner: Arc<dyn TransactionScanner>,
    ) -> Result<(), Error> {
        let id = id.into();

        if self.scanners.iter().any(|s| s.id == id) {
            return Err(Error::DuplicateScanner(id));
        }

        self.scanners.push(RegisteredScanner { id, scanner });

        Ok(())
    }

    /// Spawns the retry timer and attempts the initial connect. Calling
    /// `start` on a running session is a no-op.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut timer = self.timer.lock().expect("timer lock");

            if timer.is_some() {
                return;
            }

            let session = self.clone();
            *timer = Some(tokio::spawn(async move { session.tick_loop().await }));
        }

        if let Err(e) = self.connect().await {
            warn!("initial connect failed: {e}");
        }
    }

    /// Halts the timer and closes the connection, flushing the sync cursor.
    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().expect("timer lock").take() {
            handle.abort();
        }

        self.close();
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().expect("link lock").is_some()
    }

    pub fn check_height(&self) -> u64 {
        self.check_height.load(Ordering::SeqCst)
    }

    /// Whether a non-linear header extension was observed. Reported, never
    /// auto-resolved.
    pub fn fork_detected(&self) -> bool {
        self.flags.fork_detected.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// One reconnect attempt per tick while disconnected; otherwise each
    /// sticky flag is consumed exactly once and its resync re-issued. Fixed
    /// interval, no backoff.
    async fn tick_loop(self: Arc<Self>) {
        let mut ticks = tokio::time::interval(self.tick_interval);

        // the first tick completes immediately
        ticks.tick().await;

        loop {
            ticks.tick().await;

            if !self.is_connected() {
                if let Err(e) = self.connect().await {
                    warn!("reconnect failed: {e}");
                }
                continue;
            }

            if self.flags.inv_seen.swap(false, Ordering::SeqCst) {
                self.request_headers();
            }
            if self.flags.header_error.swap(false, Ordering::SeqCst) {
                self.request_headers();
            }
            if self.flags.block_error.swap(false, Ordering::SeqCst) {
                self.request_next_block();
            }
        }
    }

    /// Opens the socket, spawns the reader/writer pair and performs the
    /// version handshake. The link slot is claimed before the first await,
    /// so a concurrent call fails with `AlreadyConnected` without dialing a
    /// second socket.
    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let (outbound, outbound_recv) = mpsc::unbounded_channel();

        {
            let mut link = self.link.lock().expect("link lock");

            if link.is_some() {
                return Err(Error::AlreadyConnected);
            }

            // reserve the slot; messages sent while dialing queue up until
            // the writer task attaches
            *link = Some(PeerLink {
                outbound: outbound.clone(),
                reader: None,
                writer: None,
            });
        }

        match self.establish(outbound, outbound_recv).await {
            Ok(()) => {
                info!("version handshake complete");
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        outbound: mpsc::UnboundedSender<NetworkMessage>,
        outbound_recv: mpsc::UnboundedReceiver<NetworkMessage>,
    ) -> Result<(), Error> {
        info!(peer = %self.peer_address, "connecting to node...");

        let stream = TcpStream::connect(&self.peer_address).await?;

        // configure tcp
        let sock_ref = socket2::SockRef::from(&stream);
        let mut tcp_keepalive = socket2::TcpKeepalive::new();
        tcp_keepalive = tcp_keepalive.with_time(Duration::from_secs(20));
        tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(20));

        sock_ref.set_tcp_keepalive(&tcp_keepalive)?;
        sock_ref.set_tcp_nodelay(true)?;

        let (stream_read, stream_write) = stream.into_split();

        let handshake = Arc::new(Notify::new());

        let magic = self.network.magic();
        let writer = tokio::spawn(write_loop(stream_write, outbound_recv, magic));
        let reader = {
            let session = self.clone();
            let handshake = handshake.clone();
            tokio::spawn(async move { session.read_loop(stream_read, handshake).await })
        };

        outbound.send(version_message()).ok();

        {
            let mut link = self.link.lock().expect("link lock");

            match link.as_mut() {
                Some(link) => {
                    link.reader = Some(reader);
                    link.writer = Some(writer);
                }
                // the reservation was torn down while dialing
                None => {
                    reader.abort();
                    writer.abort();
                    return Err(std::io::Error::from(std::io::ErrorKind::ConnectionAborted).into());
                }
            }
        }

        match timeout(HANDSHAKE_TIMEOUT, handshake.notified()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::HandshakeTimeout),
        }
    }

    /// Idempotent: tears down both connection tasks (safe while the reader
    /// is blocked mid-read) and persists the sync cursor before returning.
    pub fn close(&self) {
        if let Some(mut link) = self.link.lock().expect("link lock").take() {
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            if let Some(writer) = link.writer.take() {
                writer.abort();
            }

            info!("connection closed");
        }

        let height = self.check_height.load(Ordering::SeqCst);
        if let Err(e) = self.store.put_cursor(height) {
            error!("flushing sync cursor failed: {e}");
        }
    }

    /// Persists a locally built transaction and announces it to the peer; it
    /// is served once on the peer's getdata, then forgotten.
    pub fn send_transaction(&self, tx: &Transaction) -> Result<(), Error> {
        self.store.put_pending_tx(tx)?;

        let txid = tx.compute_txid();
        info!(%txid, "announcing transaction");

        self.send(NetworkMessage::Inv(vec![Inventory::Transaction(txid)]));

        Ok(())
    }

    pub(crate) fn send(&self, message: NetworkMessage) {
        let link = self.link.lock().expect("link lock");

        match link.as_ref() {
            // a failed send means the writer is gone; the reader notices the
            // dead socket and teardown happens there
            Some(link) => {
                link.outbound.send(message).ok();
            }
            None => trace!(command = %message.command(), "dropping message, not connected"),
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream_read: OwnedReadHalf, handshake: Arc<Notify>) {
        loop {
            match read_message(&mut stream_read).await {
                Ok(message) => self.dispatch(message, &handshake),
                Err(e) => {
                    warn!("peer read failed: {e}");
                    break;
                }
            }
        }

        // mark disconnected; retry is deferred to the next timer tick
        self.link.lock().expect("link lock").take();
    }

    fn dispatch(&self, message: Inbound, handshake: &Notify) {
        match message {
            Inbound::Version(version) => {
                info!(version = version.version, agent = %version.user_agent, "peer version");
                self.send(NetworkMessage::Verack);
            }
            Inbound::Verack => {
                trace!("peer acknowledged version");
                handshake.notify_one();
                self.request_headers();
            }
            Inbound::Ping(nonce) => {
                trace!(nonce, "ping");
                self.send(NetworkMessage::Pong(nonce));
            }
            Inbound::Inv(inventory) => {
                if inventory
                    .iter()
                    .any(|i| matches!(i, Inventory::Block(_) | Inventory::WitnessBlock(_)))
                {
                    trace!("peer announced a new block");
                    self.flags.inv_seen.store(true, Ordering::SeqCst);
                }
            }
            Inbound::GetData(inventory) => self.serve_pending_txs(&inventory),
            Inbound::Headers(headers) => self.handle_headers(headers),
            Inbound::Block(block) => self.handle_block(block),
            Inbound::Addr(addresses) => info!(count = addresses.len(), "peer sent addresses"),
            Inbound::Unknown(command) => trace!(command = %command, "ignoring message"),
        }
    }

    fn serve_pending_txs(&self, inventory: &[Inventory]) {
        for item in inventory {
            let txid = match item {
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => *txid,
                _ => continue,
            };

            match self.store.pending_tx(&txid) {
                Ok(Some(tx)) => {
                    info!(%txid, "serving pending transaction");
                    self.send(NetworkMessage::Tx(tx));

                    // single delivery, no retry
                    if let Err(e) = self.store.delete_pending_tx(&txid) {
                        warn!(%txid, "removing served transaction failed: {e}");
                    }
                }
                Ok(None) => warn!(%txid, "peer requested unknown transaction"),
                Err(e) => warn!(%txid, "pending transaction lookup failed: {e}"),
            }
        }
    }
}

async fn read_message(stream_read: &mut OwnedReadHalf) -> Result<Inbound, Error> {
    let mut envelope = [0u8; 24];
    stream_read.read_exact(&mut envelope).await?;

    let payload_len = u32::consensus_decode_from_finite_reader(&mut &envelope[16..20])?;

    let mut payload = vec![0u8; payload_len as usize];
    stream_read.read_exact(&mut payload).await?;

    let framed = [envelope.to_vec(), payload].concat();

    Ok(Inbound::consensus_decode(&mut &framed[..])?)
}

async fn write_message(
    stream_write: &mut OwnedWriteHalf,
    message: RawNetworkMessage,
) -> Result<(), std::io::Error> {
    let mut buf = vec![];
    message.consensus_encode(&mut buf)?;
    stream_write.write_all(&buf).await?;
    stream_write.flush().await?;

    Ok(())
}

async fn write_loop(
    mut stream_write: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<NetworkMessage>,
    magic: Magic,
) {
    while let Some(message) = outbound.recv().await {
        trace!(command = %message.command(), "sending message");

        let raw = RawNetworkMessage::new(magic, message);

        if let Err(e) = write_message(&mut stream_write, raw).await {
            warn!("peer write failed: {e}");
            break;
        }
    }
}

#[cfg(test)]
impl Session {
    /// Wires a bare outbound channel in place of a live connection so the
    /// engine impls can be driven directly.
    pub(crate) fn attach_test_link(&self) -> mpsc::UnboundedReceiver<NetworkMessage> {
        let (outbound, rx) = mpsc::unbounded_channel();

        *self.link.lock().expect("link lock") = Some(PeerLink {
            outbound,
            reader: None,
            writer: None,
        });

        rx
    }
}
