//! # Storage Module
//!
//! Blocks, their on-disk encoding, the sled-backed store and the chain
//! controller that ties them together.
//!
//! ## Architecture
//!
//! ```text
//! block.rs  — Block structure, header bytes, hash/verify operations
//! codec.rs  — Versioned binary record layout for blocks at rest
//! db.rs     — sled persistence: hash → record, plus the tip pointer
//! chain.rs  — Blockchain controller (initialize, add_block) and iterator
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! add_block(data)
//!   → BlockCandidate { previous_hash: tip }
//!   → ProofOfWork::seal        (nonce search)
//!   → codec::encode
//!   → LedgerDB::commit_new_block   (record + tip, one batch)
//! ```
//!
//! Reads go the other way: `BlockchainIterator` follows previous-hash links
//! from the tip, decoding each record as it goes.

pub mod block;
pub mod chain;
pub mod codec;
pub mod db;

pub use block::{compute_header_bytes, Block, BlockCandidate, BlockVerifyError};
pub use chain::{Blockchain, BlockchainIterator};
pub use codec::{decode, encode, DecodeError};
pub use db::{DbError, LedgerDB};
