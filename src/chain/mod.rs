//! Block-chain side of the SPV protocol: the two block-header encodings,
//! merkle blocks, and the locator engine that drives header catch-up and
//! the switch to block download.

pub mod header;
pub mod locator;
pub mod merkle;

pub use header::Header;
pub use locator::NextRequest;
pub use merkle::MerkleBlock;
