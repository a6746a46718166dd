//! Ravencoin P2P wire protocol primitives.
//!
//! This module provides the low-level pieces of the node-to-node protocol:
//!
//! - the 24-byte framed message envelope with checksum validation and
//!   one-byte resynchronization on the network magic
//! - the command table and the typed [`Message`] union, decoded once at
//!   the framing boundary
//! - payload parsers and builders for every accepted command, including
//!   the Ravencoin asset-data extension
//!
//! The framing matches the Bitcoin P2P envelope; Ravencoin differs in the
//! magic values, the protocol version floor, and the asset commands
//! (`getassetdata`, `assetdata`, `asstnotfound` — the misspelling is what
//! nodes speak on the wire).

pub mod codec;
pub mod constants;
pub mod decode;
pub mod message;
pub mod payload;

pub use codec::{read_message, send_message};
pub use constants::Network;
pub use message::{Command, Message, PeerAddress, RawMessage};
