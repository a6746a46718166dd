use std::io;

use crate::pow::Hash256;

/// Byte length of a pre-KAWPOW block header.
pub const LEGACY_HEADER_LEN: usize = 80;

/// Byte length of a KAWPOW block header.
pub const KAWPOW_HEADER_LEN: usize = 120;

/// A Ravencoin block header as carried in `headers` messages.
///
/// Two encodings exist on the wire and a single message may contain a
/// legacy prefix followed by a KAWPOW suffix:
///
/// ```text
/// legacy (80 bytes)             kawpow (120 bytes)
/// 4   version                   4   version
/// 32  previous block hash       32  previous block hash
/// 32  merkle root               32  merkle root
/// 4   timestamp                 4   timestamp
/// 4   nBits                     4   nBits
/// 4   nonce                     4   height
///                               8   nonce (64-bit)
///                               32  mix hash
/// ```
///
/// In `headers` messages each header is followed by a one-byte CompactSize
/// transaction count placeholder (always zero), so the on-wire strides are
/// 81 and 121 bytes. The encoding of a header is identified by its
/// timestamp: at or after the KAWPOW activation time, headers are 120
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Legacy([u8; LEGACY_HEADER_LEN]),
    Kawpow([u8; KAWPOW_HEADER_LEN]),
}

impl Header {
    /// The raw header bytes as they appeared on the wire.
    pub fn raw(&self) -> &[u8] {
        match self {
            Header::Legacy(bytes) => bytes,
            Header::Kawpow(bytes) => bytes,
        }
    }

    /// The 80-byte prefix shared by both encodings.
    pub fn prefix80(&self) -> &[u8] {
        &self.raw()[..LEGACY_HEADER_LEN]
    }

    pub fn is_kawpow(&self) -> bool {
        matches!(self, Header::Kawpow(_))
    }

    pub fn version(&self) -> u32 {
        read_u32(self.raw(), 0)
    }

    pub fn prev_hash(&self) -> Hash256 {
        read_hash(self.raw(), 4)
    }

    pub fn merkle_root(&self) -> Hash256 {
        read_hash(self.raw(), 36)
    }

    /// Unix timestamp, byte offset 68 in both encodings.
    pub fn time(&self) -> u32 {
        read_u32(self.raw(), 68)
    }

    pub fn bits(&self) -> u32 {
        read_u32(self.raw(), 72)
    }

    /// Block height, carried explicitly only by KAWPOW headers.
    pub fn height(&self) -> Option<u32> {
        match self {
            Header::Legacy(_) => None,
            Header::Kawpow(bytes) => Some(read_u32(bytes, 76)),
        }
    }

    /// 64-bit nonce of a KAWPOW header.
    pub fn nonce64(&self) -> Option<u64> {
        match self {
            Header::Legacy(_) => None,
            Header::Kawpow(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[80..88]);
                Some(u64::from_le_bytes(buf))
            }
        }
    }

    /// Mix hash of a KAWPOW header, in wire byte order.
    pub fn mix_hash(&self) -> Option<Hash256> {
        match self {
            Header::Legacy(_) => None,
            Header::Kawpow(bytes) => Some(read_hash(bytes, 88)),
        }
    }
}

/// Decodes the body of a `headers` message (after the leading CompactSize
/// count) into `count` tagged headers.
///
/// The legacy/KAWPOW boundary is detected by scanning each header's
/// timestamp: once a timestamp at or past `kawpow_activation` appears, that
/// header and all following ones use the 120-byte encoding. The message
/// must be consumed exactly; trailing bytes are malformed.
pub fn decode_headers(
    payload: &[u8],
    count: usize,
    kawpow_activation: u32,
) -> io::Result<Vec<Header>> {
    let mut headers = Vec::with_capacity(count.min(2000));
    let mut cursor = 0;

    for _ in 0..count {
        if payload.len() < cursor + LEGACY_HEADER_LEN {
            return Err(malformed("headers: truncated header"));
        }

        let time = read_u32(payload, cursor + 68);
        let stride = if time >= kawpow_activation {
            KAWPOW_HEADER_LEN
        } else {
            LEGACY_HEADER_LEN
        };

        // header bytes + the one-byte tx count placeholder
        if payload.len() < cursor + stride + 1 {
            return Err(malformed("headers: truncated header"));
        }

        let header = if stride == KAWPOW_HEADER_LEN {
            let mut bytes = [0u8; KAWPOW_HEADER_LEN];
            bytes.copy_from_slice(&payload[cursor..cursor + KAWPOW_HEADER_LEN]);
            Header::Kawpow(bytes)
        } else {
            let mut bytes = [0u8; LEGACY_HEADER_LEN];
            bytes.copy_from_slice(&payload[cursor..cursor + LEGACY_HEADER_LEN]);
            Header::Legacy(bytes)
        };

        headers.push(header);
        cursor += stride + 1;
    }

    if cursor != payload.len() {
        return Err(malformed("headers: trailing bytes after last header"));
    }

    Ok(headers)
}

fn malformed(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, context)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_hash(bytes: &[u8], offset: usize) -> Hash256 {
    bytes[offset..offset + 32].try_into().unwrap()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const ACTIVATION: u32 = 1_588_788_000;

    #[test]
    fn decode_pure_legacy_run() {
        let headers: Vec<Header> = (0..3)
            .map(|i| Header::Legacy(legacy_header(ACTIVATION - 600 * (3 - i))))
            .collect();
        let body = headers_body(&headers);

        let decoded = decode_headers(&body, 3, ACTIVATION).unwrap();
        assert_eq!(decoded, headers);
        assert!(decoded.iter().all(|h| !h.is_kawpow()));
    }

    #[test]
    fn decode_pure_kawpow_run() {
        let headers: Vec<Header> = (0..3)
            .map(|i| Header::Kawpow(kawpow_header(ACTIVATION + 60 * i, 100 + i, i as u64, [0xAB; 32])))
            .collect();
        let body = headers_body(&headers);

        let decoded = decode_headers(&body, 3, ACTIVATION).unwrap();
        assert_eq!(decoded, headers);
        assert_eq!(decoded[1].height(), Some(101));
        assert_eq!(decoded[1].nonce64(), Some(1));
        assert_eq!(decoded[1].mix_hash(), Some([0xAB; 32]));
    }

    #[test]
    fn decode_legacy_prefix_then_kawpow_suffix() {
        let headers = vec![
            Header::Legacy(legacy_header(ACTIVATION - 1200)),
            Header::Legacy(legacy_header(ACTIVATION - 600)),
            Header::Kawpow(kawpow_header(ACTIVATION, 1, 42, [0xCD; 32])),
            Header::Kawpow(kawpow_header(ACTIVATION + 60, 2, 43, [0xEF; 32])),
        ];
        let body = headers_body(&headers);

        let decoded = decode_headers(&body, 4, ACTIVATION).unwrap();
        assert_eq!(decoded, headers);
        assert_eq!(decoded.iter().filter(|h| h.is_kawpow()).count(), 2);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let body = headers_body(&[Header::Legacy(legacy_header(1000))]);
        assert!(decode_headers(&body[..body.len() - 2], 1, ACTIVATION).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut body = headers_body(&[Header::Legacy(legacy_header(1000))]);
        body.push(0xFF);
        assert!(decode_headers(&body, 1, ACTIVATION).is_err());
    }

    #[test]
    fn timestamp_sits_at_offset_68_in_both_encodings() {
        let legacy = Header::Legacy(legacy_header(123_456));
        let kawpow = Header::Kawpow(kawpow_header(ACTIVATION + 9, 0, 0, [0; 32]));
        assert_eq!(legacy.time(), 123_456);
        assert_eq!(kawpow.time(), ACTIVATION + 9);
    }

    #[test]
    fn legacy_header_has_no_kawpow_fields() {
        let h = Header::Legacy(legacy_header(1000));
        assert_eq!(h.height(), None);
        assert_eq!(h.nonce64(), None);
        assert_eq!(h.mix_hash(), None);
    }
}
