use std::io;

use crate::chain::header::{self, Header};
use crate::pow::{sha256d, Hash256};
use crate::wire::constants::BLOCK_MAX_TIME_DRIFT;

/// A merkle block: a block header plus a partial merkle tree proving
/// inclusion of the transactions that matched the remote node's bloom
/// filter.
///
/// Wire layout (`merkleblock` message):
///
/// ```text
/// 80 | 120  block header (encoding chosen by timestamp)
/// 4         total transaction count in the block
/// varint    number of hashes
/// 32 * n    partial merkle tree hashes
/// varint    flag byte count
/// 1 * m     flag bits, least significant bit first
/// ```
///
/// Headers relayed from a `headers` message are represented as merkle
/// blocks with an empty partial tree.
///
/// The proof-of-work target check lives behind the
/// [`HeaderHasher`](crate::pow::HeaderHasher) seam and is the owner's
/// responsibility; validity here covers timestamp drift and partial-tree
/// consistency.
#[derive(Debug, Clone, PartialEq)]
pub struct MerkleBlock {
    pub header: Header,
    pub total_tx: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    /// Wraps a bare header (from a `headers` message) as a merkle block
    /// with no transactions.
    pub fn from_header(header: Header) -> MerkleBlock {
        MerkleBlock {
            header,
            total_tx: 0,
            hashes: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Parses a `merkleblock` message payload.
    pub fn parse(payload: &[u8], kawpow_activation: u32) -> io::Result<MerkleBlock> {
        if payload.len() < header::LEGACY_HEADER_LEN {
            return Err(malformed("merkleblock: truncated header"));
        }

        let time = u32::from_le_bytes(payload[68..72].try_into().unwrap());
        let header = if time >= kawpow_activation {
            if payload.len() < header::KAWPOW_HEADER_LEN {
                return Err(malformed("merkleblock: truncated header"));
            }
            let mut bytes = [0u8; header::KAWPOW_HEADER_LEN];
            bytes.copy_from_slice(&payload[..header::KAWPOW_HEADER_LEN]);
            Header::Kawpow(bytes)
        } else {
            let mut bytes = [0u8; header::LEGACY_HEADER_LEN];
            bytes.copy_from_slice(&payload[..header::LEGACY_HEADER_LEN]);
            Header::Legacy(bytes)
        };

        let mut c = header.raw().len();
        let total_tx = read_u32(payload, &mut c)?;

        let hash_count = read_varint(payload, &mut c)? as usize;
        if hash_count > total_tx as usize {
            return Err(malformed("merkleblock: more hashes than transactions"));
        }
        let mut hashes = Vec::with_capacity(hash_count.min(payload.len() / 32));
        for _ in 0..hash_count {
            let hash: Hash256 = payload
                .get(c..c + 32)
                .ok_or_else(|| malformed("merkleblock: truncated hash"))?
                .try_into()
                .unwrap();
            c += 32;
            hashes.push(hash);
        }

        let flag_len = read_varint(payload, &mut c)? as usize;
        let flags = payload
            .get(c..)
            .and_then(|tail| tail.get(..flag_len))
            .ok_or_else(|| malformed("merkleblock: truncated flags"))?
            .to_vec();
        c += flag_len;

        if c != payload.len() {
            return Err(malformed("merkleblock: trailing bytes"));
        }

        Ok(MerkleBlock {
            header,
            total_tx,
            hashes,
            flags,
        })
    }

    /// Double-SHA256 of the 80-byte header prefix.
    ///
    /// This is the header commitment that KAWPOW light verification takes
    /// as input. For legacy headers it is NOT the proof-of-work block hash
    /// (that is X16R/X16Rv2-derived); it serves as a stable identifier for
    /// logging and bookkeeping.
    pub fn sha256d_hash(&self) -> Hash256 {
        sha256d(self.header.prefix80())
    }

    /// The transaction hashes this partial merkle tree proves, in tree
    /// order. Empty for header-only blocks or inconsistent trees.
    pub fn tx_hashes(&self) -> Vec<Hash256> {
        match self.walk_tree() {
            Some((_, matched)) => matched,
            None => Vec::new(),
        }
    }

    /// Checks timestamp drift and partial-merkle-tree consistency.
    pub fn is_valid(&self, now: u32) -> bool {
        if self.header.time() > now.saturating_add(BLOCK_MAX_TIME_DRIFT) {
            return false;
        }

        if self.total_tx == 0 {
            return self.hashes.is_empty() && self.flags.is_empty();
        }

        match self.walk_tree() {
            Some((root, _)) => root == self.header.merkle_root(),
            None => false,
        }
    }

    /// Depth-first walk of the partial merkle tree. Returns the computed
    /// root and the matched leaf hashes, or None if the tree is
    /// inconsistent with the flag bits.
    fn walk_tree(&self) -> Option<(Hash256, Vec<Hash256>)> {
        if self.total_tx == 0 {
            return None;
        }

        let mut height = 0u32;
        while tree_width(self.total_tx, height) > 1 {
            height += 1;
        }

        let mut walker = TreeWalker {
            block: self,
            hash_idx: 0,
            bit_idx: 0,
            matched: Vec::new(),
        };
        let root = walker.traverse(height, 0)?;

        // every hash must be accounted for
        if walker.hash_idx != self.hashes.len() {
            return None;
        }

        Some((root, walker.matched))
    }
}

struct TreeWalker<'a> {
    block: &'a MerkleBlock,
    hash_idx: usize,
    bit_idx: usize,
    matched: Vec<Hash256>,
}

fn tree_width(total_tx: u32, height: u32) -> u64 {
    (total_tx as u64 + (1u64 << height) - 1) >> height
}

impl TreeWalker<'_> {
    fn next_bit(&mut self) -> Option<bool> {
        let byte = *self.block.flags.get(self.bit_idx / 8)?;
        let bit = byte >> (self.bit_idx % 8) & 1 == 1;
        self.bit_idx += 1;
        Some(bit)
    }

    fn next_hash(&mut self) -> Option<Hash256> {
        let hash = *self.block.hashes.get(self.hash_idx)?;
        self.hash_idx += 1;
        Some(hash)
    }

    fn traverse(&mut self, height: u32, pos: u64) -> Option<Hash256> {
        let parent_of_match = self.next_bit()?;

        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matched.push(hash);
            }
            return Some(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.block.total_tx, height - 1) {
            self.traverse(height - 1, pos * 2 + 1)?
        } else {
            left
        };

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&left);
        concat[32..].copy_from_slice(&right);
        Some(sha256d(&concat))
    }
}

fn malformed(context: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, context)
}

fn read_u32(p: &[u8], c: &mut usize) -> io::Result<u32> {
    let bytes: [u8; 4] = p
        .get(*c..*c + 4)
        .ok_or_else(|| malformed("merkleblock: truncated u32"))?
        .try_into()
        .unwrap();
    *c += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_varint(p: &[u8], c: &mut usize) -> io::Result<u64> {
    let first = *p
        .get(*c)
        .ok_or_else(|| malformed("merkleblock: truncated varint"))?;
    *c += 1;
    match first {
        0xFD => {
            let bytes: [u8; 2] = p
                .get(*c..*c + 2)
                .ok_or_else(|| malformed("merkleblock: truncated varint"))?
                .try_into()
                .unwrap();
            *c += 2;
            Ok(u16::from_le_bytes(bytes) as u64)
        }
        0xFE => {
            let bytes: [u8; 4] = p
                .get(*c..*c + 4)
                .ok_or_else(|| malformed("merkleblock: truncated varint"))?
                .try_into()
                .unwrap();
            *c += 4;
            Ok(u32::from_le_bytes(bytes) as u64)
        }
        0xFF => {
            let bytes: [u8; 8] = p
                .get(*c..*c + 8)
                .ok_or_else(|| malformed("merkleblock: truncated varint"))?
                .try_into()
                .unwrap();
            *c += 8;
            Ok(u64::from_le_bytes(bytes))
        }
        n => Ok(n as u64),
    }
}
