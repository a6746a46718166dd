use std::io;

use crate::chain::header::{self, Header};
use crate::wire::constants::MIN_PROTO_VERSION;
use crate::wire::message::{Asset, AssetReply, InvVector, PeerAddress, RejectMessage, VersionMessage};

/// Implemented by types that can be decoded from a raw message payload.
pub trait Decode: Sized {
    fn decode(payload: &[u8]) -> io::Result<Self>;
}

impl Decode for VersionMessage {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() < 85 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "version: payload shorter than 85 bytes",
            ));
        }

        let mut c = 0;

        let version = read_u32(payload, &mut c)?;
        let services = read_u64(payload, &mut c)?;
        let timestamp = read_u64(payload, &mut c)?;
        let recv_services = read_u64(payload, &mut c)?;
        let recv_address = read_addr16(payload, &mut c)?;
        let recv_port = u16::from_be_bytes(slice2(payload, &mut c, "version: recv_port")?);
        let from_services = read_u64(payload, &mut c)?;
        let from_address = read_addr16(payload, &mut c)?;
        let from_port = u16::from_be_bytes(slice2(payload, &mut c, "version: from_port")?);
        let nonce = read_u64(payload, &mut c)?;

        let user_agent = read_varstring(payload, &mut c, "version: user_agent")?;

        let start_height = read_u32(payload, &mut c)?;
        let relay = payload.get(c).map(|&b| b != 0);

        if version < MIN_PROTO_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "version: protocol version not supported",
            ));
        }

        Ok(VersionMessage {
            version,
            services,
            timestamp,
            recv_services,
            recv_address,
            recv_port,
            from_services,
            from_address,
            from_port,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

impl Decode for Vec<PeerAddress> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let count = read_varint(payload, &mut c)? as usize;

        let needed = count
            .checked_mul(30)
            .and_then(|n| n.checked_add(c))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "addr: count overflow"))?;
        if payload.len() < needed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "addr: length does not match entry count",
            ));
        }

        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let timestamp = read_u32(payload, &mut c)? as u64;
            let services = read_u64(payload, &mut c)?;
            let address = read_addr16(payload, &mut c)?;
            let port = u16::from_be_bytes(slice2(payload, &mut c, "addr: port")?);
            entries.push(PeerAddress {
                address,
                port,
                services,
                timestamp,
            });
        }

        Ok(entries)
    }
}

impl Decode for Vec<InvVector> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let count = read_varint(payload, &mut c)? as usize;

        let needed = count
            .checked_mul(36)
            .and_then(|n| n.checked_add(c))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "inv: count overflow"))?;
        if payload.len() < needed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "inv: length does not match entry count",
            ));
        }

        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let type_id = read_u32(payload, &mut c)?;
            let hash = read_addr32(payload, &mut c)?;
            entries.push(InvVector { type_id, hash });
        }

        Ok(entries)
    }
}

impl Decode for RejectMessage {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let command = read_varstring(payload, &mut c, "reject: command")?;
        let code = *payload.get(c).ok_or_else(|| eof("reject: code"))?;
        c += 1;
        let reason = read_varstring(payload, &mut c, "reject: reason")?;

        // a rejected tx carries the offending txid
        let tx_hash = if command == "tx" {
            Some(read_addr32(payload, &mut c)?)
        } else {
            None
        };

        Ok(RejectMessage {
            command,
            code,
            reason,
            tx_hash,
        })
    }
}

impl Decode for AssetReply {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;

        let name = read_varstring(payload, &mut c, "assetdata: name")?;

        // wire sentinel for "no such asset"; nothing follows the name
        if name == "_NF" {
            return Ok(AssetReply::NotFound);
        }

        let amount = read_u64(payload, &mut c)?;
        let units = *payload.get(c).ok_or_else(|| eof("assetdata: units"))?;
        c += 1;
        let reissuable = *payload.get(c).ok_or_else(|| eof("assetdata: reissuable"))? != 0;
        c += 1;
        let has_ipfs = *payload.get(c).ok_or_else(|| eof("assetdata: has_ipfs"))? != 0;
        c += 1;

        let ipfs_len = read_varint(payload, &mut c)? as usize;
        let ipfs_hash = if (has_ipfs || ipfs_len != 0) && ipfs_len <= payload.len() - c {
            let encoded = bs58::encode(&payload[c..c + ipfs_len]).into_string();
            Some(encoded)
        } else {
            None
        };

        // trailing block height is not consumed

        Ok(AssetReply::Found(Asset {
            name,
            amount,
            units,
            reissuable,
            ipfs_hash,
        }))
    }
}

impl Decode for Vec<String> {
    fn decode(payload: &[u8]) -> io::Result<Self> {
        let mut c = 0;
        let count = read_varint(payload, &mut c)? as usize;

        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "asstnotfound: empty name list",
            ));
        }

        let mut names = Vec::with_capacity(count.min(512));

        for _ in 0..count {
            names.push(read_varstring(payload, &mut c, "asstnotfound: name")?);
        }

        Ok(names)
    }
}

/// Decodes a full `headers` payload: CompactSize count followed by the
/// mixed-encoding header run.
pub fn decode_headers_message(payload: &[u8], kawpow_activation: u32) -> io::Result<Vec<Header>> {
    let mut c = 0;
    let count = read_varint(payload, &mut c)? as usize;
    header::decode_headers(&payload[c..], count, kawpow_activation)
}

// --- helpers ----------------------------------------------------------------

fn eof(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, context)
}

/// Bitcoin-style CompactSize. Non-shortest encodings are accepted, as in
/// the reference implementation.
pub(crate) fn read_varint(p: &[u8], c: &mut usize) -> io::Result<u64> {
    let first = *p.get(*c).ok_or_else(|| eof("varint"))?;
    *c += 1;
    match first {
        0xFD => {
            let v = u16::from_le_bytes(slice2(p, c, "varint:fd")?);
            Ok(v as u64)
        }
        0xFE => {
            let v = u32::from_le_bytes(slice4(p, c, "varint:fe")?);
            Ok(v as u64)
        }
        0xFF => {
            let v = u64::from_le_bytes(slice8(p, c, "varint:ff")?);
            Ok(v)
        }
        n => Ok(n as u64),
    }
}

fn read_varstring(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<String> {
    let len = read_varint(p, c)? as usize;
    let bytes = p
        .get(*c..)
        .and_then(|tail| tail.get(..len))
        .ok_or_else(|| eof(ctx))?;
    let s = std::str::from_utf8(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_string();
    *c += len;
    Ok(s)
}

fn read_u32(p: &[u8], c: &mut usize) -> io::Result<u32> {
    Ok(u32::from_le_bytes(slice4(p, c, "u32")?))
}

fn read_u64(p: &[u8], c: &mut usize) -> io::Result<u64> {
    Ok(u64::from_le_bytes(slice8(p, c, "u64")?))
}

fn read_addr16(p: &[u8], c: &mut usize) -> io::Result<[u8; 16]> {
    let b = p
        .get(*c..*c + 16)
        .ok_or_else(|| eof("addr16"))?
        .try_into()
        .unwrap();
    *c += 16;
    Ok(b)
}

fn read_addr32(p: &[u8], c: &mut usize) -> io::Result<[u8; 32]> {
    let b = p
        .get(*c..*c + 32)
        .ok_or_else(|| eof("hash32"))?
        .try_into()
        .unwrap();
    *c += 32;
    Ok(b)
}

fn slice2(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 2]> {
    let b = p
        .get(*c..*c + 2)
        .ok_or_else(|| eof(ctx))?
        .try_into()
        .unwrap();
    *c += 2;
    Ok(b)
}

fn slice4(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 4]> {
    let b = p
        .get(*c..*c + 4)
        .ok_or_else(|| eof(ctx))?
        .try_into()
        .unwrap();
    *c += 4;
    Ok(b)
}

fn slice8(p: &[u8], c: &mut usize, ctx: &'static str) -> io::Result<[u8; 8]> {
    let b = p
        .get(*c..*c + 8)
        .ok_or_else(|| eof(ctx))?
        .try_into()
        .unwrap();
    *c += 8;
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::constants::PROTOCOL_VERSION;
    use crate::wire::message::InvType;
    use crate::wire::payload;

    /// Encodes a 26-byte net_addr field (services + 16-byte IP + port)
    /// with the standard ::ffff: v4-mapped prefix.
    fn net_addr_bytes(services: u64, ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut b = vec![];
        b.extend_from_slice(&services.to_le_bytes());
        b.extend_from_slice(&[0u8; 10]);
        b.extend_from_slice(&[0xff, 0xff]);
        b.extend_from_slice(&ip);
        b.extend_from_slice(&port.to_be_bytes());
        b
    }

    /// Realistic version payload for protocol v70027.
    fn version_payload_v70027() -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        p.extend_from_slice(&1u64.to_le_bytes()); // services: NODE_NETWORK
        p.extend_from_slice(&1_700_000_000u64.to_le_bytes());
        p.extend(net_addr_bytes(0, [192, 168, 1, 1], 8767)); // addr_recv
        p.extend(net_addr_bytes(1, [10, 0, 0, 1], 8767)); // addr_from
        p.extend_from_slice(&0x1234_5678_90ab_cdefu64.to_le_bytes()); // nonce
        let ua = b"/Ravencoin:4.3.2.1/";
        p.push(ua.len() as u8);
        p.extend_from_slice(ua);
        p.extend_from_slice(&2_200_000u32.to_le_bytes()); // start_height
        p.push(0); // relay = false (SPV peers)
        p
    }

    #[test]
    fn decode_version_all_fields() {
        let msg = VersionMessage::decode(&version_payload_v70027()).unwrap();

        assert_eq!(msg.version, 70027);
        assert_eq!(msg.services, 1);
        assert_eq!(msg.timestamp, 1_700_000_000);
        assert_eq!(msg.user_agent, "/Ravencoin:4.3.2.1/");
        assert_eq!(msg.start_height, 2_200_000);
        assert_eq!(msg.relay, Some(false));
        assert_eq!(msg.recv_port, 8767);
        assert_eq!(msg.nonce, 0x1234_5678_90ab_cdef);
        assert_eq!(&msg.from_address[12..], &[10, 0, 0, 1]);
    }

    #[test]
    fn decode_version_rejects_old_protocol() {
        let mut p = version_payload_v70027();
        p[0..4].copy_from_slice(&70025u32.to_le_bytes());
        assert!(VersionMessage::decode(&p).is_err());
    }

    #[test]
    fn decode_version_accepts_min_protocol() {
        let mut p = version_payload_v70027();
        p[0..4].copy_from_slice(&70026u32.to_le_bytes());
        assert!(VersionMessage::decode(&p).is_ok());
    }

    #[test]
    fn decode_version_rejects_short_payload() {
        assert!(VersionMessage::decode(&[0u8; 84]).is_err());
    }

    #[test]
    fn decode_version_relay_absent_when_byte_missing() {
        let mut p = version_payload_v70027();
        p.pop();
        let msg = VersionMessage::decode(&p).unwrap();
        assert_eq!(msg.relay, None);
    }

    #[test]
    fn decode_addr_two_entries() {
        let mut p = vec![2u8];
        p.extend_from_slice(&1_700_000_100u32.to_le_bytes());
        p.extend(net_addr_bytes(1, [1, 2, 3, 4], 8767));
        p.extend_from_slice(&1_700_000_200u32.to_le_bytes());
        p.extend(net_addr_bytes(1, [5, 6, 7, 8], 18770));

        let entries = Vec::<PeerAddress>::decode(&p).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp, 1_700_000_100);
        assert_eq!(entries[0].port, 8767);
        assert!(entries[0].is_ipv4());
        assert_eq!(entries[0].host(), "1.2.3.4");
        assert_eq!(entries[1].port, 18770);
    }

    #[test]
    fn decode_addr_empty_list() {
        assert!(Vec::<PeerAddress>::decode(&[0x00]).unwrap().is_empty());
    }

    #[test]
    fn decode_addr_truncated_entry_is_error() {
        let mut p = vec![1u8];
        p.extend_from_slice(&1_700_000_100u32.to_le_bytes());
        p.extend(net_addr_bytes(1, [1, 2, 3, 4], 8767));
        p.truncate(p.len() - 3);
        assert!(Vec::<PeerAddress>::decode(&p).is_err());
    }

    #[test]
    fn decode_inv_mixed_types() {
        let mut p = vec![3u8];
        p.extend_from_slice(&1u32.to_le_bytes());
        p.extend_from_slice(&[0xAA; 32]);
        p.extend_from_slice(&2u32.to_le_bytes());
        p.extend_from_slice(&[0xBB; 32]);
        p.extend_from_slice(&9u32.to_le_bytes()); // unknown type survives raw
        p.extend_from_slice(&[0xCC; 32]);

        let entries = Vec::<InvVector>::decode(&p).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].inv_type(), Some(InvType::Tx));
        assert_eq!(entries[1].inv_type(), Some(InvType::Block));
        assert_eq!(entries[2].inv_type(), None);
        assert_eq!(entries[2].type_id, 9);
        assert_eq!(entries[1].hash, [0xBB; 32]);
    }

    #[test]
    fn decode_inv_count_length_mismatch_is_error() {
        let mut p = vec![2u8];
        p.extend_from_slice(&1u32.to_le_bytes());
        p.extend_from_slice(&[0xAA; 32]);
        assert!(Vec::<InvVector>::decode(&p).is_err());
    }

    #[test]
    fn decode_reject_with_tx_hash() {
        let mut p = vec![];
        p.push(2);
        p.extend_from_slice(b"tx");
        p.push(0x42); // code
        p.push(16);
        p.extend_from_slice(b"insufficient fee");
        p.extend_from_slice(&[0xDD; 32]);

        let reject = RejectMessage::decode(&p).unwrap();
        assert_eq!(reject.command, "tx");
        assert_eq!(reject.code, 0x42);
        assert_eq!(reject.reason, "insufficient fee");
        assert_eq!(reject.tx_hash, Some([0xDD; 32]));
    }

    #[test]
    fn decode_reject_without_tx_hash() {
        let mut p = vec![];
        p.push(7);
        p.extend_from_slice(b"version");
        p.push(0x11);
        p.push(9);
        p.extend_from_slice(b"duplicate");

        let reject = RejectMessage::decode(&p).unwrap();
        assert_eq!(reject.command, "version");
        assert_eq!(reject.tx_hash, None);
    }

    #[test]
    fn decode_reject_tx_missing_hash_is_error() {
        let mut p = vec![];
        p.push(2);
        p.extend_from_slice(b"tx");
        p.push(0x42);
        p.push(0);
        assert!(RejectMessage::decode(&p).is_err());
    }

    // assetdata examples mirror the observed node responses: the asset
    // name "ASSET_JEREMY", amount 100000000, and either no IPFS hash or a
    // 34-byte multihash.

    #[test]
    fn decode_assetdata_without_ipfs() {
        let mut p = vec![];
        p.push(12);
        p.extend_from_slice(b"ASSET_JEREMY");
        p.extend_from_slice(&100_000_000u64.to_le_bytes());
        p.push(0); // units
        p.push(1); // reissuable
        p.push(0); // hasIPFS
        p.push(0); // IPFS hash length
        p.extend_from_slice(&501u32.to_le_bytes()); // block height (ignored)

        let AssetReply::Found(asset) = AssetReply::decode(&p).unwrap() else {
            panic!("expected Found");
        };
        assert_eq!(asset.name, "ASSET_JEREMY");
        assert_eq!(asset.amount, 100_000_000);
        assert_eq!(asset.units, 0);
        assert!(asset.reissuable);
        assert_eq!(asset.ipfs_hash, None);
    }

    #[test]
    fn decode_assetdata_with_ipfs_multihash() {
        let multihash = {
            let mut m = vec![0x12, 0x20];
            m.extend_from_slice(&[0xAB; 32]);
            m
        };

        let mut p = vec![];
        p.push(5);
        p.extend_from_slice(b"MEDIA");
        p.extend_from_slice(&1_000u64.to_le_bytes());
        p.push(2);
        p.push(0);
        p.push(1); // hasIPFS
        p.push(multihash.len() as u8);
        p.extend_from_slice(&multihash);

        let AssetReply::Found(asset) = AssetReply::decode(&p).unwrap() else {
            panic!("expected Found");
        };
        let encoded = asset.ipfs_hash.expect("ipfs hash");
        assert_eq!(encoded, bs58::encode(&multihash).into_string());
        // a 34-byte multihash renders as 46 base58 characters
        assert_eq!(encoded.len(), 46);
    }

    #[test]
    fn decode_assetdata_not_found_sentinel() {
        let mut p = vec![3u8];
        p.extend_from_slice(b"_NF");
        assert_eq!(AssetReply::decode(&p).unwrap(), AssetReply::NotFound);
    }

    #[test]
    fn decode_assetdata_truncated_amount_is_error() {
        let mut p = vec![3u8];
        p.extend_from_slice(b"XYZ");
        p.extend_from_slice(&[0u8; 4]);
        assert!(AssetReply::decode(&p).is_err());
    }

    #[test]
    fn decode_asstnotfound_names() {
        let mut p = vec![2u8];
        p.push(12);
        p.extend_from_slice(b"ASSET_JEREMY");
        p.push(14);
        p.extend_from_slice(b"BAD_ASSET_NAME");

        let names = Vec::<String>::decode(&p).unwrap();
        assert_eq!(names, vec!["ASSET_JEREMY", "BAD_ASSET_NAME"]);
    }

    #[test]
    fn decode_asstnotfound_empty_list_is_error() {
        assert!(Vec::<String>::decode(&[0x00]).is_err());
    }

    #[test]
    fn varint_accepts_all_widths() {
        for (bytes, expected) in [
            (vec![0x00], 0u64),
            (vec![0xFC], 0xFC),
            (vec![0xFD, 0xFD, 0x00], 0xFD),
            (vec![0xFD, 0x39, 0x30], 12345),
            (vec![0xFE, 0x40, 0xE2, 0x01, 0x00], 123_456),
            (
                vec![0xFF, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
                1 << 32,
            ),
        ] {
            let mut c = 0;
            assert_eq!(read_varint(&bytes, &mut c).unwrap(), expected);
            assert_eq!(c, bytes.len());
        }
    }

    #[test]
    fn varint_accepts_non_shortest_encoding() {
        // 5 encoded wide: the reference implementation parses these
        // idempotently rather than rejecting them
        let mut c = 0;
        assert_eq!(read_varint(&[0xFD, 0x05, 0x00], &mut c).unwrap(), 5);
    }

    #[test]
    fn varint_round_trips_through_writer() {
        for value in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, 1 << 40] {
            let mut buf = Vec::new();
            payload::write_varint(value, &mut buf);
            let mut c = 0;
            assert_eq!(read_varint(&buf, &mut c).unwrap(), value);
            assert_eq!(c, buf.len());
        }
    }
}
