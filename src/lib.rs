//! Ravencoin SPV peer connection.
//!
//! One [`Peer`] per remote node: it opens the TCP connection, performs the
//! version handshake, validates the framed message stream, and drives the
//! SPV chain-download protocol (headers, block locators, block
//! inventories, merkleblocks and their transactions) plus the Ravencoin
//! asset-data queries. The owning peer manager supplies wallet knowledge
//! through [`PeerDelegate`] hooks and the proof-of-work primitives through
//! [`pow::HeaderHasher`]; everything else — framing, parsing, timeouts,
//! the per-peer reader thread — lives here.
//!
//! Protocol reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html (Ravencoin
//! shares the Bitcoin envelope; magic values, the KAWPOW header encoding
//! and the asset commands differ).

pub mod chain;
mod error;
pub mod peer;
pub mod pow;
pub mod wire;

pub use error::PeerError;
pub use peer::{AssetCallback, Peer, PeerDelegate, PeerStatus, PingCallback};
pub use pow::{Hash256, HeaderHasher};
pub use wire::constants::Network;
pub use wire::message::{Asset, PeerAddress, RawTx};
