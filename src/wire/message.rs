use std::io;

use crate::chain::{Header, MerkleBlock};
use crate::pow::{sha256d, Hash256};
use crate::wire::constants::Network;
use crate::wire::decode::Decode;

/// A raw message frame as transmitted on the wire.
///
/// A frame consists of:
/// - 4-byte magic value (network identifier)
/// - 12-byte command, ASCII, zero padded
/// - 4-byte payload length
/// - 4-byte checksum
/// - variable-length payload (up to 32 MiB)
///
/// `RawMessage` carries the decoded header fields and payload; the payload
/// has not yet been interpreted.
#[derive(Debug)]
pub struct RawMessage {
    pub command: Command,
    pub payload: Vec<u8>,
    pub magic: [u8; 4],
    pub checksum: [u8; 4],
}

impl RawMessage {
    /// Decodes the payload into a typed [`Message`]. Network-dependent
    /// header parsing (KAWPOW activation) requires the network.
    pub fn into_message(self, network: Network) -> io::Result<Message> {
        Message::decode_raw(self, network)
    }
}

/// The node-to-node commands this peer understands.
///
/// `asstnotfound` preserves the misspelling Ravencoin nodes use on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Handshake and control
    Version,
    Verack,
    Addr,
    GetAddr,
    Ping,
    Pong,
    Reject,
    FeeFilter,
    // Data
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    Tx,
    Mempool,
    MerkleBlock,
    FilterLoad,
    // Ravencoin assets
    GetAssetData,
    AssetData,
    AssetNotFound,

    Unknown,
}

impl From<&[u8; 12]> for Command {
    fn from(bytes: &[u8; 12]) -> Self {
        let cmd = std::str::from_utf8(bytes)
            .unwrap_or("")
            .trim_matches(char::from(0));

        match cmd {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "addr" => Command::Addr,
            "getaddr" => Command::GetAddr,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "reject" => Command::Reject,
            "feefilter" => Command::FeeFilter,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "notfound" => Command::NotFound,
            "getblocks" => Command::GetBlocks,
            "getheaders" => Command::GetHeaders,
            "headers" => Command::Headers,
            "tx" => Command::Tx,
            "mempool" => Command::Mempool,
            "merkleblock" => Command::MerkleBlock,
            "filterload" => Command::FilterLoad,
            "getassetdata" => Command::GetAssetData,
            "assetdata" => Command::AssetData,
            "asstnotfound" => Command::AssetNotFound,
            _ => Command::Unknown,
        }
    }
}

impl Command {
    /// Returns the 12-byte command field: ASCII, padded with zero bytes.
    pub fn as_bytes(&self) -> [u8; 12] {
        let name: &[u8] = match self {
            Command::Version => b"version",
            Command::Verack => b"verack",
            Command::Addr => b"addr",
            Command::GetAddr => b"getaddr",
            Command::Ping => b"ping",
            Command::Pong => b"pong",
            Command::Reject => b"reject",
            Command::FeeFilter => b"feefilter",
            Command::Inv => b"inv",
            Command::GetData => b"getdata",
            Command::NotFound => b"notfound",
            Command::GetBlocks => b"getblocks",
            Command::GetHeaders => b"getheaders",
            Command::Headers => b"headers",
            Command::Tx => b"tx",
            Command::Mempool => b"mempool",
            Command::MerkleBlock => b"merkleblock",
            Command::FilterLoad => b"filterload",
            Command::GetAssetData => b"getassetdata",
            Command::AssetData => b"assetdata",
            Command::AssetNotFound => b"asstnotfound",
            Command::Unknown => b"",
        };

        let mut padded = [0u8; 12];
        padded[..name.len()].copy_from_slice(name);
        padded
    }
}

/// A fully decoded message: one variant per accepted command, decoded once
/// at the framing boundary.
#[derive(Debug)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Addr(Vec<PeerAddress>),
    Inv(Vec<InvVector>),
    Tx(RawTx),
    Headers(Vec<Header>),
    GetAddr,
    GetData(Vec<InvVector>),
    NotFound(Vec<InvVector>),
    Ping(u64),
    Pong(u64),
    MerkleBlock(MerkleBlock),
    Reject(RejectMessage),
    FeeFilter(u64),
    AssetData(AssetReply),
    AssetNotFound(Vec<String>),

    /// Commands we receive but do not act on (getblocks, getheaders,
    /// filterload, mempool from the remote side) and anything unknown.
    Ignored { command: Command, length: usize },
}

impl Message {
    fn decode_raw(raw: RawMessage, network: Network) -> io::Result<Message> {
        match raw.command {
            Command::Version => Ok(Message::Version(VersionMessage::decode(&raw.payload)?)),
            Command::Verack => Ok(Message::Verack),
            Command::Addr => Ok(Message::Addr(Vec::<PeerAddress>::decode(&raw.payload)?)),
            Command::Inv => Ok(Message::Inv(Vec::<InvVector>::decode(&raw.payload)?)),
            Command::Tx => Ok(Message::Tx(RawTx::from_bytes(raw.payload))),
            Command::Headers => Ok(Message::Headers(
                crate::wire::decode::decode_headers_message(
                    &raw.payload,
                    network.kawpow_activation(),
                )?,
            )),
            Command::GetAddr => Ok(Message::GetAddr),
            Command::GetData => Ok(Message::GetData(Vec::<InvVector>::decode(&raw.payload)?)),
            Command::NotFound => Ok(Message::NotFound(Vec::<InvVector>::decode(&raw.payload)?)),
            Command::Ping => Ok(Message::Ping(decode_nonce(&raw.payload, "ping")?)),
            Command::Pong => Ok(Message::Pong(decode_nonce(&raw.payload, "pong")?)),
            Command::MerkleBlock => Ok(Message::MerkleBlock(MerkleBlock::parse(
                &raw.payload,
                network.kawpow_activation(),
            )?)),
            Command::Reject => Ok(Message::Reject(RejectMessage::decode(&raw.payload)?)),
            Command::FeeFilter => Ok(Message::FeeFilter(decode_nonce(&raw.payload, "feefilter")?)),
            Command::AssetData => Ok(Message::AssetData(AssetReply::decode(&raw.payload)?)),
            Command::AssetNotFound => {
                Ok(Message::AssetNotFound(Vec::<String>::decode(&raw.payload)?))
            }
            command => Ok(Message::Ignored {
                command,
                length: raw.payload.len(),
            }),
        }
    }
}

fn decode_nonce(payload: &[u8], what: &'static str) -> io::Result<u64> {
    let bytes: [u8; 8] = payload
        .get(..8)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, what))?
        .try_into()
        .unwrap();
    Ok(u64::from_le_bytes(bytes))
}

/// A peer's network identity as carried in `version` and `addr` payloads
/// and handed to the peer manager: 16-byte address (IPv4 as
/// v4-mapped-IPv6), port, advertised services and last-seen timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub address: [u8; 16],
    pub port: u16,
    pub services: u64,
    pub timestamp: u64,
}

impl PeerAddress {
    pub fn new(ip: std::net::IpAddr, port: u16) -> PeerAddress {
        let address = match ip {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            std::net::IpAddr::V6(v6) => v6.octets(),
        };
        PeerAddress {
            address,
            port,
            services: 0,
            timestamp: 0,
        }
    }

    /// True when the 16-byte field is a v4-mapped IPv6 address.
    pub fn is_ipv4(&self) -> bool {
        self.address[..10] == [0u8; 10] && self.address[10..12] == [0xff, 0xff]
    }

    pub fn ip(&self) -> std::net::IpAddr {
        if self.is_ipv4() {
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(
                self.address[12],
                self.address[13],
                self.address[14],
                self.address[15],
            ))
        } else {
            std::net::IpAddr::V6(std::net::Ipv6Addr::from(self.address))
        }
    }

    /// Display name of the peer address.
    pub fn host(&self) -> String {
        self.ip().to_string()
    }
}

/// Decoded `version` payload.
#[derive(Debug, Clone)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub recv_services: u64,
    pub recv_address: [u8; 16],
    pub recv_port: u16,
    pub from_services: u64,
    pub from_address: [u8; 16],
    pub from_port: u16,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
    pub relay: Option<bool>,
}

/// Inventory object types used in `inv`, `getdata` and `notfound`.
/// Serialized as little-endian 32-bit unsigned integers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Tx = 1,
    Block = 2,
    FilteredBlock = 3,
}

impl InvType {
    pub fn to_le_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }
}

/// One `(type, hash)` inventory entry. The type is kept raw so unknown
/// values survive into `notfound` replies unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvVector {
    pub type_id: u32,
    pub hash: Hash256,
}

impl InvVector {
    pub fn new(inv_type: InvType, hash: Hash256) -> InvVector {
        InvVector {
            type_id: inv_type as u32,
            hash,
        }
    }

    pub fn inv_type(&self) -> Option<InvType> {
        match self.type_id {
            1 => Some(InvType::Tx),
            2 => Some(InvType::Block),
            3 => Some(InvType::FilteredBlock),
            _ => None,
        }
    }
}

/// A transaction as received in a `tx` message. Transactions stay opaque
/// to this crate; the txid is the double SHA256 of the serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTx {
    pub hash: Hash256,
    pub bytes: Vec<u8>,
}

impl RawTx {
    pub fn from_bytes(bytes: Vec<u8>) -> RawTx {
        RawTx {
            hash: sha256d(&bytes),
            bytes,
        }
    }
}

/// Decoded `reject` payload (BIP 61). `tx_hash` is present when the
/// rejected command is `tx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub command: String,
    pub code: u8,
    pub reason: String,
    pub tx_hash: Option<Hash256>,
}

/// A Ravencoin asset record from an `assetdata` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub amount: u64,
    pub units: u8,
    pub reissuable: bool,
    /// Multihash rendered as base58, when the asset carries an IPFS hash.
    pub ipfs_hash: Option<String>,
}

/// An `assetdata` reply: either the asset record, or the wire sentinel
/// `"_NF"` signalling that the queried asset does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetReply {
    NotFound,
    Found(Asset),
}
