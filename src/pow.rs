//! Proof-of-work seam.
//!
//! Ravencoin has used three header hash functions over its life: X16R,
//! X16Rv2 (from October 2019) and KAWPOW (from May 2020). The algorithms
//! themselves live outside this crate; the locator engine only needs their
//! outputs, so they are injected through the [`HeaderHasher`] trait at
//! [`Peer`](crate::peer::Peer) construction.

use sha2::{Digest, Sha256};

/// A 32-byte hash in wire byte order (reverse of the canonical display
/// order used by block explorers).
pub type Hash256 = [u8; 32];

/// Header hash functions supplied by the embedding application.
///
/// `kawpow_light` is the light verification function of the KAWPOW
/// algorithm: given the double-SHA256 of the 80-byte header prefix, the mix
/// hash carried in the header and the 64-bit nonce, it returns the final
/// block hash. Both 32-byte inputs and the output are in canonical display
/// order; [`chain::locator`](crate::chain::locator) performs the byte
/// reversals around the call.
pub trait HeaderHasher: Send + Sync {
    fn x16r(&self, header: &[u8; 80]) -> Hash256;
    fn x16rv2(&self, header: &[u8; 80]) -> Hash256;
    fn kawpow_light(&self, header_hash: Hash256, mix_hash: Hash256, nonce: u64) -> Hash256;
}

/// SHA256(SHA256(data)), the hash used for checksums, txids and the KAWPOW
/// header commitment.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let hash = Sha256::digest(Sha256::digest(data));
    let mut out = [0u8; 32];
    out.copy_from_slice(&hash);
    out
}

/// Flips a hash between wire byte order and canonical display order.
pub fn reverse32(mut hash: Hash256) -> Hash256 {
    hash.reverse();
    hash
}

/// Hex rendering of a hash in canonical display order, for log output.
pub fn display_hex(hash: &Hash256) -> String {
    hex::encode(reverse32(*hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input_matches_known_vector() {
        let hash = sha256d(&[]);
        assert_eq!(
            hex::encode(hash),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn reverse32_is_an_involution() {
        let mut h = [0u8; 32];
        for (i, b) in h.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(reverse32(reverse32(h)), h);
        assert_eq!(reverse32(h)[0], 31);
    }
}
