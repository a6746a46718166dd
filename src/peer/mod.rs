//! Per-peer connection state machine.
//!
//! A [`Peer`] owns one connection to a remote Ravencoin node: a dedicated
//! reader thread runs the blocking read loop while the peer manager drives
//! sends, setters and disconnects from its own threads. One mutex guards
//! the peer state, a second serializes writes to the socket (outbound
//! messages are totally ordered on the wire), and the cross-thread
//! deadlines are atomics the reader polls between socket operations.

mod delegate;
pub(crate) mod handlers;
mod runtime;

pub use delegate::{AssetCallback, PeerDelegate, PingCallback};

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::chain::MerkleBlock;
use crate::error::PeerError;
use crate::pow::{display_hex, Hash256, HeaderHasher};
use crate::wire::constants::{
    Network, CONNECT_TIMEOUT, MAX_GETDATA_HASHES, MAX_MSG_LENGTH, MEMPOOL_TIMEOUT,
};
use crate::wire::message::{Command, PeerAddress};
use crate::wire::payload;

use delegate::NoopDelegate;

/// Connection status of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Partially assembled merkleblock: after a `merkleblock` message with
/// outstanding transactions, the block waits here until its last `tx`
/// arrives. Any other message abandons it.
pub(crate) enum BlockAssembly {
    Idle,
    AwaitingTx {
        block: MerkleBlock,
        /// Outstanding tx hashes in reverse order, so arrivals pop cheaply
        /// from the tail.
        pending: Vec<Hash256>,
    },
}

pub(crate) struct State {
    pub status: PeerStatus,
    pub waiting_for_network: bool,

    // negotiation
    pub version: u32,
    pub remote_services: u64,
    pub remote_timestamp: u64,
    pub useragent: String,
    pub lastblock: u32,
    pub nonce: u64,
    pub fee_per_kb: u64,

    // handshake and request flags, monotonic within a session
    pub sent_verack: bool,
    pub got_verack: bool,
    pub sent_getaddr: bool,
    pub sent_filter: bool,
    pub sent_getdata: bool,
    pub sent_mempool: bool,
    pub sent_getblocks: bool,

    // timing
    pub start_time: Option<Instant>,
    pub ping_time: f64,

    // known-hash memory
    pub last_block_hash: Hash256,
    pub known_tx_hashes: Vec<Hash256>,
    pub known_tx_set: HashSet<Hash256>,
    pub known_block_hashes: Vec<Hash256>,
    pub assembly: BlockAssembly,

    // outstanding requests
    pub pong_callbacks: VecDeque<Option<PingCallback>>,
    pub mempool_callback: Option<PingCallback>,
    pub asset_callback: Option<AssetCallback>,
}

impl State {
    fn new() -> State {
        State {
            status: PeerStatus::Disconnected,
            waiting_for_network: false,
            version: 0,
            remote_services: 0,
            remote_timestamp: 0,
            useragent: String::new(),
            lastblock: 0,
            nonce: 0,
            fee_per_kb: 0,
            sent_verack: false,
            got_verack: false,
            sent_getaddr: false,
            sent_filter: false,
            sent_getdata: false,
            sent_mempool: false,
            sent_getblocks: false,
            start_time: None,
            ping_time: f64::MAX,
            last_block_hash: [0u8; 32],
            known_tx_hashes: Vec::new(),
            known_tx_set: HashSet::new(),
            known_block_hashes: Vec::new(),
            assembly: BlockAssembly::Idle,
            pong_callbacks: VecDeque::new(),
            mempool_callback: None,
            asset_callback: None,
        }
    }

    /// Records tx hashes we have seen, keeping the ordered sequence and
    /// the set view consistent.
    pub fn add_known_tx_hashes(&mut self, hashes: &[Hash256]) {
        for hash in hashes {
            if self.known_tx_set.insert(*hash) {
                self.known_tx_hashes.push(*hash);
            }
        }
    }
}

/// An absolute deadline published across threads. Microseconds since the
/// process epoch; `u64::MAX` means disabled.
pub(crate) struct Deadline(AtomicU64);

impl Deadline {
    fn new() -> Deadline {
        Deadline(AtomicU64::new(u64::MAX))
    }

    pub fn set_after(&self, delay: Duration) {
        self.0
            .store(now_micros() + delay.as_micros() as u64, Ordering::Release);
    }

    pub fn disable(&self) {
        self.0.store(u64::MAX, Ordering::Release);
    }

    pub fn is_expired(&self) -> bool {
        now_micros() >= self.0.load(Ordering::Acquire)
    }
}

fn now_micros() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Current unix time in seconds.
pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) struct Shared {
    pub network: Network,
    pub remote: PeerAddress,
    pub hasher: Arc<dyn HeaderHasher>,

    /// Write half of the socket; holding this lock serializes sends.
    pub conn: Mutex<Option<TcpStream>>,
    /// Local disconnect latch; the reader exits cleanly once set.
    pub closed: AtomicBool,

    pub state: Mutex<State>,
    pub delegate: Mutex<Arc<dyn PeerDelegate>>,

    pub disconnect_at: Deadline,
    pub mempool_at: Deadline,
    pub needs_filter_update: AtomicBool,
    pub current_block_height: AtomicU32,
    pub earliest_key_time: AtomicU32,
}

impl Shared {
    pub fn delegate(&self) -> Arc<dyn PeerDelegate> {
        self.delegate.lock().unwrap().clone()
    }

    /// host:port tag prefixed to every log line for this peer.
    pub fn log_id(&self) -> String {
        format!("{}:{}", self.remote.host(), self.remote.port)
    }

    /// Requests a disconnect: latches the closed flag and shuts the socket
    /// down so the reader unblocks promptly.
    pub fn request_disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(stream) = self.conn.lock().unwrap().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Frames and writes one message. Writes are serialized by the
    /// connection lock and byte-contiguous on the wire; a failed or timed
    /// out write closes the connection (the reader reports the
    /// disconnect).
    pub fn send_message(&self, command: Command, msg_payload: &[u8]) {
        if msg_payload.len() > MAX_MSG_LENGTH as usize {
            warn!(
                "[{}] failed to send {:?}, length {} is too long",
                self.log_id(),
                command,
                msg_payload.len()
            );
            return;
        }

        let frame = crate::wire::codec::encode_message(self.network.magic(), command, msg_payload);
        debug!("[{}] sending {:?}", self.log_id(), command);

        let mut error: Option<PeerError> = None;
        {
            let mut conn = self.conn.lock().unwrap();
            let Some(stream) = conn.as_mut() else {
                warn!("[{}] not connected, dropping {:?}", self.log_id(), command);
                return;
            };

            let mut written = 0;
            while written < frame.len() {
                if self.closed.load(Ordering::Acquire) {
                    return;
                }
                match stream.write(&frame[written..]) {
                    Ok(0) => {
                        error = Some(PeerError::ConnectionReset);
                        break;
                    }
                    Ok(n) => written += n,
                    Err(e) if runtime::is_transient(&e) => {
                        if self.disconnect_at.is_expired() {
                            error = Some(PeerError::TimedOut);
                            break;
                        }
                    }
                    Err(e) => {
                        error = Some(PeerError::from_socket(e));
                        break;
                    }
                }
            }

            if error.is_some() {
                self.closed.store(true, Ordering::Release);
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        if let Some(err) = error {
            warn!("[{}] send failed: {}", self.log_id(), err);
        }
    }

    /// Sends a `ping` carrying our version nonce and queues the callback
    /// on the pong FIFO.
    pub fn send_ping(&self, callback: Option<PingCallback>) {
        let nonce = {
            let mut st = self.state.lock().unwrap();
            st.start_time = Some(Instant::now());
            st.pong_callbacks.push_back(callback);
            st.nonce
        };
        self.send_message(Command::Ping, &payload::build_nonce_payload(nonce));
    }

    pub fn send_verack(&self) {
        self.send_message(Command::Verack, &[]);
        self.state.lock().unwrap().sent_verack = true;
    }

    pub fn send_getdata(&self, tx_hashes: &[Hash256], block_hashes: &[Hash256]) {
        let count = tx_hashes.len() + block_hashes.len();
        if count > MAX_GETDATA_HASHES {
            warn!(
                "[{}] couldn't send getdata, {} is too many items, max is {}",
                self.log_id(),
                count,
                MAX_GETDATA_HASHES
            );
        } else if count > 0 {
            self.state.lock().unwrap().sent_getdata = true;
            self.send_message(
                Command::GetData,
                &payload::build_getdata_payload(tx_hashes, block_hashes),
            );
        }
    }

    pub fn send_getblocks(&self, locators: &[Hash256], hash_stop: Hash256) {
        if locators.is_empty() {
            return;
        }
        info!(
            "[{}] calling getblocks with locators [{}, {}]",
            self.log_id(),
            display_hex(&locators[0]),
            display_hex(&locators[locators.len() - 1])
        );
        self.state.lock().unwrap().sent_getblocks = true;
        self.send_message(
            Command::GetBlocks,
            &payload::build_locator_payload(locators, hash_stop),
        );
    }

    pub fn send_getheaders(&self, locators: &[Hash256], hash_stop: Hash256) {
        if locators.is_empty() {
            return;
        }
        info!(
            "[{}] calling getheaders with locators [{}, {}]",
            self.log_id(),
            display_hex(&locators[0]),
            display_hex(&locators[locators.len() - 1])
        );
        self.send_message(
            Command::GetHeaders,
            &payload::build_locator_payload(locators, hash_stop),
        );
    }
}

/// One connection to a remote Ravencoin node.
///
/// Cheap to clone; all clones share the same connection. Dropping the last
/// clone after the reader has terminated releases every resource.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

impl Peer {
    /// Allocates a peer in the `Disconnected` state. The hasher supplies
    /// the X16R/X16Rv2/KAWPOW primitives used to derive chain locators.
    pub fn new(network: Network, remote: PeerAddress, hasher: Arc<dyn HeaderHasher>) -> Peer {
        Peer {
            shared: Arc::new(Shared {
                network,
                remote,
                hasher,
                conn: Mutex::new(None),
                closed: AtomicBool::new(false),
                state: Mutex::new(State::new()),
                delegate: Mutex::new(Arc::new(NoopDelegate)),
                disconnect_at: Deadline::new(),
                mempool_at: Deadline::new(),
                needs_filter_update: AtomicBool::new(false),
                current_block_height: AtomicU32::new(0),
                earliest_key_time: AtomicU32::new(0),
            }),
        }
    }

    /// Installs the peer manager hooks. Call before [`connect`](Peer::connect).
    pub fn set_delegate(&self, delegate: Arc<dyn PeerDelegate>) {
        *self.shared.delegate.lock().unwrap() = delegate;
    }

    /// Wallet creation time; headers older than a week before it are
    /// skipped during block download.
    pub fn set_earliest_key_time(&self, earliest_key_time: u32) {
        self.shared
            .earliest_key_time
            .store(earliest_key_time, Ordering::Release);
    }

    /// Call when the local block height changes (helps detect tarpit
    /// nodes sending short inventories).
    pub fn set_current_block_height(&self, height: u32) {
        self.shared
            .current_block_height
            .store(height, Ordering::Release);
    }

    /// Call when wallet addresses need to be added to the bloom filter;
    /// block fetches are suppressed until the filter is resent.
    pub fn set_needs_filter_update(&self, needs_update: bool) {
        self.shared
            .needs_filter_update
            .store(needs_update, Ordering::Release);
    }

    pub fn status(&self) -> PeerStatus {
        self.shared.state.lock().unwrap().status
    }

    /// Opens the connection and performs the handshake on a dedicated
    /// reader thread. While `network_is_reachable` returns false the peer
    /// waits; calling `connect` again retries.
    pub fn connect(&self) {
        let delegate = self.shared.delegate();

        {
            let mut st = self.shared.state.lock().unwrap();
            if st.status != PeerStatus::Disconnected && !st.waiting_for_network {
                return;
            }
            st.status = PeerStatus::Connecting;
        }

        if !delegate.network_is_reachable() {
            let mut st = self.shared.state.lock().unwrap();
            if !st.waiting_for_network {
                info!("[{}] waiting for network reachability", self.shared.log_id());
            }
            st.waiting_for_network = true;
            return;
        }

        info!("[{}] connecting", self.shared.log_id());
        self.shared.state.lock().unwrap().waiting_for_network = false;
        self.shared.closed.store(false, Ordering::Release);
        self.shared.disconnect_at.set_after(CONNECT_TIMEOUT);

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("peer-{}", self.shared.remote.host()))
            .spawn(move || runtime::run(shared));

        if spawned.is_err() {
            warn!("[{}] error creating thread", self.shared.log_id());
            self.shared.state.lock().unwrap().status = PeerStatus::Disconnected;
        }
    }

    /// Closes the socket; the reader observes the shutdown and terminates,
    /// failing outstanding callbacks and firing the disconnected hook.
    pub fn disconnect(&self) {
        self.shared.request_disconnect();
    }

    /// (Re)schedules an automatic disconnect, or cancels it with `None`.
    /// Useful as a sync timeout.
    pub fn schedule_disconnect(&self, after: Option<Duration>) {
        match after {
            Some(delay) => self.shared.disconnect_at.set_after(delay),
            None => self.shared.disconnect_at.disable(),
        }
    }

    /// Display name of the peer address.
    pub fn host(&self) -> String {
        self.shared.remote.host()
    }

    /// Remote protocol version, once the handshake has delivered it.
    pub fn version(&self) -> u32 {
        self.shared.state.lock().unwrap().version
    }

    /// Remote user agent string.
    pub fn user_agent(&self) -> String {
        self.shared.state.lock().unwrap().useragent.clone()
    }

    /// Best block height the remote reported in its `version`.
    pub fn last_block(&self) -> u32 {
        self.shared.state.lock().unwrap().lastblock
    }

    /// Smoothed ping time in seconds (50% low-pass over measured round
    /// trips, seeded by the verack round trip).
    pub fn ping_time(&self) -> f64 {
        self.shared.state.lock().unwrap().ping_time
    }

    /// Minimum relay fee the remote advertised via `feefilter`.
    pub fn fee_per_kb(&self) -> u64 {
        self.shared.state.lock().unwrap().fee_per_kb
    }

    /// Sends a raw, already-serialized payload as the given command.
    pub fn send_message(&self, msg_payload: &[u8], command: Command) {
        self.shared.send_message(command, msg_payload);
    }

    /// Sends a serialized bloom filter. Re-arms the mempool request gate
    /// so a fresh `mempool` can follow the new filter.
    pub fn send_filterload(&self, filter: &[u8]) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.sent_filter = true;
            st.sent_mempool = false;
        }
        self.shared.send_message(Command::FilterLoad, filter);
    }

    /// Requests the remote mempool. The completion fires once: with
    /// success when the reply has been flushed through a chained ping,
    /// with failure on the mempool deadline, a duplicate request or
    /// disconnect.
    pub fn send_mempool(&self, known_tx_hashes: &[Hash256], completion: Option<PingCallback>) {
        let rejected = {
            let mut st = self.shared.state.lock().unwrap();
            let already = st.sent_mempool || st.mempool_callback.is_some();
            st.sent_mempool = true;

            if already {
                completion
            } else {
                st.add_known_tx_hashes(known_tx_hashes);
                if let Some(callback) = completion {
                    st.mempool_callback = Some(callback);
                    self.shared.mempool_at.set_after(MEMPOOL_TIMEOUT);
                }
                None
            }
        };

        if let Some(callback) = rejected {
            debug!("[{}] mempool request already sent", self.shared.log_id());
            callback(false);
        } else {
            self.shared.send_message(Command::Mempool, &[]);
        }
    }

    /// Requests headers after the given locators (catch-up phase).
    pub fn send_getheaders(&self, locators: &[Hash256], hash_stop: Hash256) {
        self.shared.send_getheaders(locators, hash_stop);
    }

    /// Requests block inventories after the given locators (download
    /// phase).
    pub fn send_getblocks(&self, locators: &[Hash256], hash_stop: Hash256) {
        self.shared.send_getblocks(locators, hash_stop);
    }

    /// Announces transactions. Hashes already known to this peer are
    /// skipped.
    pub fn send_inv(&self, tx_hashes: &[Hash256]) {
        let announce = {
            let mut st = self.shared.state.lock().unwrap();
            let known_before = st.known_tx_hashes.len();
            st.add_known_tx_hashes(tx_hashes);
            st.known_tx_hashes[known_before..].to_vec()
        };

        if !announce.is_empty() {
            self.shared
                .send_message(Command::Inv, &payload::build_inv_payload(&announce));
        }
    }

    /// Requests transactions and filtered blocks.
    pub fn send_getdata(&self, tx_hashes: &[Hash256], block_hashes: &[Hash256]) {
        self.shared.send_getdata(tx_hashes, block_hashes);
    }

    /// Queries asset metadata by name. The callback receives `None` for a
    /// not-found reply and stays armed for subsequent replies.
    pub fn send_get_asset(&self, name: &str, callback: AssetCallback) {
        info!("[{}] requesting asset data for [{}]", self.shared.log_id(), name);
        self.shared.state.lock().unwrap().asset_callback = Some(callback);
        self.shared.send_message(
            Command::GetAssetData,
            &payload::build_getassetdata_payload(name),
        );
    }

    /// Asks the remote for addresses of other peers.
    pub fn send_getaddr(&self) {
        self.shared.state.lock().unwrap().sent_getaddr = true;
        self.shared.send_message(Command::GetAddr, &[]);
    }

    /// Sends a ping; the callback fires once with success on the matching
    /// pong, or with failure on disconnect.
    pub fn send_ping(&self, callback: Option<PingCallback>) {
        self.shared.send_ping(callback);
    }

    /// Re-requests remembered block hashes starting at `from_block`,
    /// typically after a bloom filter update made earlier blocks
    /// incomplete.
    pub fn rerequest_blocks(&self, from_block: Hash256) {
        let blocks = {
            let mut st = self.shared.state.lock().unwrap();
            let mut i = st.known_block_hashes.len();
            while i > 0 && st.known_block_hashes[i - 1] != from_block {
                i -= 1;
            }
            if i == 0 {
                return;
            }
            st.known_block_hashes.drain(..i - 1);
            st.known_block_hashes.clone()
        };

        info!(
            "[{}] re-requesting {} block(s)",
            self.shared.log_id(),
            blocks.len()
        );
        self.shared.send_getdata(&[], &blocks);
    }
}
