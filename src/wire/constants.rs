use std::time::Duration;

/// Ravencoin network flavor.
///
/// The network selects the magic value that prefixes every message header,
/// the default P2P port, and the proof-of-work activation timestamps used
/// when decoding block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Network magic value used in the message header.
    ///
    /// The first 4 bytes of every message identify the network and act as a
    /// message boundary marker in the TCP stream. Serialized little-endian,
    /// the mainnet value reads "RAVN" on the wire (reversed from
    /// chainparams).
    pub const fn magic(self) -> u32 {
        match self {
            Network::Mainnet => 0x4e564152, // RAVN
            Network::Testnet => 0x544e5652, // RVNT
            Network::Regtest => 0x574f5243, // CROW
        }
    }

    /// Default P2P port for the network.
    pub const fn standard_port(self) -> u16 {
        match self {
            Network::Mainnet => 8767,
            Network::Testnet => 18770,
            Network::Regtest => 18444,
        }
    }

    /// Unix timestamp at which X16Rv2 replaced X16R as the header hash.
    pub const fn x16rv2_activation(self) -> u32 {
        match self {
            Network::Mainnet => 1_569_945_600,
            Network::Testnet => 1_567_533_600,
            Network::Regtest => 1_569_945_600,
        }
    }

    /// Unix timestamp at which KAWPOW replaced X16Rv2 and headers grew from
    /// 80 to 120 bytes (explicit height, 64-bit nonce and mix hash).
    pub const fn kawpow_activation(self) -> u32 {
        match self {
            Network::Mainnet => 1_588_788_000,
            Network::Testnet => 1_585_159_200,
            Network::Regtest => 3_582_830_167, // effectively disabled
        }
    }
}

/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: u32 = 70027;

/// Peers below this protocol version are rejected during the handshake
/// (they predate the v0.9 tx fee relay rules).
pub const MIN_PROTO_VERSION: u32 = 70026;

/// Services we advertise: none, we don't serve blocks to remote nodes.
pub const ENABLED_SERVICES: u64 = 0;

/// Service bit set by full nodes that can be asked for full blocks.
pub const SERVICES_NODE_NETWORK: u64 = 1;

/// User agent sent in our `version` message.
pub const USER_AGENT: &str = "/rvn-network:0.1.0/";

/// Size of the fixed message header: magic, command, length, checksum.
pub const HEADER_LENGTH: usize = 24;

/// Upper bound on a message payload (32 MiB).
pub const MAX_MSG_LENGTH: u32 = 0x0200_0000;

/// Upper bound on inventory entries in a single inv/getdata/notfound.
pub const MAX_GETDATA_HASHES: usize = 50_000;

/// Largest transaction we will serve in response to a getdata.
pub const TX_MAX_SIZE: usize = 100_000;

/// How far a block timestamp may sit in the future and still validate.
pub const BLOCK_MAX_TIME_DRIFT: u32 = 2 * 60 * 60;

/// Largest assetdata payload we accept before dropping the message.
pub const MAX_ASSET_DATA_LENGTH: usize = 16_898;

/// Deadline for the TCP connect plus handshake start.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for receiving the remainder of a message once its header has
/// arrived; reset whenever any payload bytes make progress.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-syscall socket send/receive timeout, so the reader thread never
/// blocks long enough to miss a deadline check.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

/// How long we wait for a mempool reply before pinging to flush it.
pub const MEMPOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Our own address as sent in the `from` fields of `version`:
/// 127.0.0.1 as a v4-mapped IPv6 address.
pub const LOCAL_HOST: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 127, 0, 0, 1];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_magic_reads_ravn_on_the_wire() {
        assert_eq!(Network::Mainnet.magic().to_le_bytes(), *b"RAVN");
    }

    #[test]
    fn testnet_magic_reads_rvnt_on_the_wire() {
        assert_eq!(Network::Testnet.magic().to_le_bytes(), *b"RVNT");
    }

    #[test]
    fn regtest_magic_reads_crow_on_the_wire() {
        assert_eq!(Network::Regtest.magic().to_le_bytes(), *b"CROW");
    }

    #[test]
    fn activation_times_are_ordered() {
        for net in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            assert!(net.x16rv2_activation() < net.kawpow_activation());
        }
    }
}
