use byteorder::{LittleEndian, WriteBytesExt};
use std::io;

use crate::pow::Hash256;
use crate::wire::constants::{ENABLED_SERVICES, LOCAL_HOST, PROTOCOL_VERSION, USER_AGENT};
use crate::wire::message::{InvType, InvVector, PeerAddress};

/// Builds a `version` payload for the outbound handshake.
///
/// Layout:
///
/// ```text
/// u32      protocol version
/// u64      services
/// u64      timestamp
/// u64      recv services
/// 16       recv address
/// u16 BE   recv port
/// u64      from services
/// 16       from address
/// u16 BE   from port
/// u64      nonce
/// varstr   user agent
/// u32      start height
/// u8       relay
/// ```
///
/// The remote peer's identity is echoed in the `recv` fields; the `from`
/// fields carry the loopback v4-mapped address and the network's standard
/// port. Relay is 0: transactions must pass our bloom filter.
pub fn build_version_payload(
    remote: &PeerAddress,
    standard_port: u16,
    nonce: u64,
    timestamp: u64,
) -> io::Result<Vec<u8>> {
    let mut payload = vec![];

    payload.write_u32::<LittleEndian>(PROTOCOL_VERSION)?;
    payload.write_u64::<LittleEndian>(ENABLED_SERVICES)?;
    payload.write_u64::<LittleEndian>(timestamp)?;
    payload.write_u64::<LittleEndian>(remote.services)?;
    payload.extend_from_slice(&remote.address);
    payload.extend_from_slice(&remote.port.to_be_bytes());
    payload.write_u64::<LittleEndian>(ENABLED_SERVICES)?;
    payload.extend_from_slice(&LOCAL_HOST);
    payload.extend_from_slice(&standard_port.to_be_bytes());
    payload.write_u64::<LittleEndian>(nonce)?;
    write_varint(USER_AGENT.len() as u64, &mut payload);
    payload.extend_from_slice(USER_AGENT.as_bytes());
    payload.write_u32::<LittleEndian>(0)?; // last block received
    payload.push(0); // relay off, SPV bloom filter mode

    Ok(payload)
}

/// Builds the shared `getheaders`/`getblocks` payload:
///
/// ```text
/// u32      protocol version
/// varint   locator count
/// 32 * n   block locator hashes
/// 32       hash stop (zero = no stop)
/// ```
pub fn build_locator_payload(locators: &[Hash256], hash_stop: Hash256) -> Vec<u8> {
    let mut payload = Vec::new();

    payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    write_varint(locators.len() as u64, &mut payload);
    for hash in locators {
        payload.extend_from_slice(hash);
    }
    payload.extend_from_slice(&hash_stop);

    payload
}

/// Builds an `inv` payload announcing transactions.
pub fn build_inv_payload(tx_hashes: &[Hash256]) -> Vec<u8> {
    let mut payload = Vec::new();

    write_varint(tx_hashes.len() as u64, &mut payload);
    for hash in tx_hashes {
        payload.extend_from_slice(&InvType::Tx.to_le_bytes());
        payload.extend_from_slice(hash);
    }

    payload
}

/// Builds a `getdata` payload: transactions first, then the blocks,
/// requested as filtered blocks so the remote applies our bloom filter.
pub fn build_getdata_payload(tx_hashes: &[Hash256], block_hashes: &[Hash256]) -> Vec<u8> {
    let mut payload = Vec::new();

    write_varint((tx_hashes.len() + block_hashes.len()) as u64, &mut payload);
    for hash in tx_hashes {
        payload.extend_from_slice(&InvType::Tx.to_le_bytes());
        payload.extend_from_slice(hash);
    }
    for hash in block_hashes {
        payload.extend_from_slice(&InvType::FilteredBlock.to_le_bytes());
        payload.extend_from_slice(hash);
    }

    payload
}

/// Builds a `notfound` payload echoing the entries we could not serve.
pub fn build_notfound_payload(entries: &[InvVector]) -> Vec<u8> {
    let mut payload = Vec::new();

    write_varint(entries.len() as u64, &mut payload);
    for entry in entries {
        payload.extend_from_slice(&entry.type_id.to_le_bytes());
        payload.extend_from_slice(&entry.hash);
    }

    payload
}

/// Builds a `ping`/`pong` payload: the 8-byte nonce.
pub fn build_nonce_payload(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

/// Builds an empty `addr` payload: we advertise no peers.
pub fn build_empty_addr_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    write_varint(0, &mut payload);
    payload
}

/// Builds a `getassetdata` payload querying a single asset by name:
///
/// ```text
/// varint   asset count (always 1)
/// varint   name length
/// bytes    name
/// ```
pub fn build_getassetdata_payload(name: &str) -> Vec<u8> {
    let mut payload = Vec::new();

    write_varint(1, &mut payload);
    write_varint(name.len() as u64, &mut payload);
    payload.extend_from_slice(name.as_bytes());

    payload
}

/// Writes a Bitcoin-style CompactSize (varint) in shortest form.
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend(&value.to_le_bytes());
        }
    }
}

/// Serialized size of a CompactSize value.
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}
