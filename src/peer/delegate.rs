use crate::chain::MerkleBlock;
use crate::error::PeerError;
use crate::pow::Hash256;
use crate::wire::message::{Asset, PeerAddress, RawTx};

/// Completion callback for an in-flight `ping` or `mempool` request:
/// invoked exactly once, with `true` on acknowledgement and `false` when
/// the connection terminates first.
pub type PingCallback = Box<dyn FnOnce(bool) + Send>;

/// Callback for `getassetdata` replies. `None` reports a not-found
/// (`"_NF"`) answer. The callback stays armed across replies, since one
/// request may fan out into several `asstnotfound` entries.
pub type AssetCallback = Box<dyn Fn(Option<Asset>) + Send>;

/// Hooks the owning peer manager supplies to a peer.
///
/// All methods are invoked on the peer's reader thread, in the order the
/// triggering messages arrived on the wire. Default implementations make
/// every hook optional.
pub trait PeerDelegate: Send + Sync {
    /// The version/verack handshake completed in both directions.
    fn connected(&self) {}

    /// The connection terminated. `error` is None for a locally requested
    /// disconnect.
    fn disconnected(&self, error: Option<PeerError>) {
        let _ = error;
    }

    /// An `addr` message relayed usable peer addresses.
    fn relayed_peers(&self, peers: Vec<PeerAddress>) {
        let _ = peers;
    }

    /// A `tx` message arrived.
    fn relayed_tx(&self, tx: RawTx) {
        let _ = tx;
    }

    /// An `inv` announced a transaction we already know.
    fn has_tx(&self, tx_hash: Hash256) {
        let _ = tx_hash;
    }

    /// A BIP 61 `reject` named one of our transactions.
    fn rejected_tx(&self, tx_hash: Hash256, code: u8) {
        let _ = (tx_hash, code);
    }

    /// A `merkleblock` (or a header from a `headers` message) completed.
    fn relayed_block(&self, block: MerkleBlock) {
        let _ = block;
    }

    /// A `notfound` reported data the remote could not serve.
    fn notfound(&self, tx_hashes: Vec<Hash256>, block_hashes: Vec<Hash256>) {
        let _ = (tx_hashes, block_hashes);
    }

    /// A BIP 133 `feefilter` updated the remote's minimum relay fee.
    fn set_fee_per_kb(&self, fee_per_kb: u64) {
        let _ = fee_per_kb;
    }

    /// The remote asked for one of our transactions via `getdata`.
    fn requested_tx(&self, tx_hash: Hash256) -> Option<RawTx> {
        let _ = tx_hash;
        None
    }

    /// Gate for [`Peer::connect`](crate::peer::Peer::connect): while this
    /// returns false the peer waits instead of dialing.
    fn network_is_reachable(&self) -> bool {
        true
    }

    /// Invoked as the last act of the reader thread.
    fn thread_cleanup(&self) {}
}

/// Delegate used until the owner installs one.
pub(crate) struct NoopDelegate;

impl PeerDelegate for NoopDelegate {}
