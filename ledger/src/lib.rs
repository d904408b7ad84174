// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # pow-ledger — Core Library
//!
//! A single-process, tamper-evident ledger: an append-only chain of
//! immutable blocks, each bound to its predecessor by hash, admitted only
//! after a proof-of-work search, and persisted in sled with atomic
//! block-plus-tip commits.
//!
//! There is no networking, no consensus between parties and no transaction
//! model. A block's payload is opaque bytes.
//!
//! ## Architecture
//!
//! - **config** — Constants and the per-chain [`ChainConfig`].
//! - **crypto** — SHA-256 helpers and the [`BlockHash`] type.
//! - **pow** — Nonce search against a power-of-two target.
//! - **storage** — Block model, codec, sled store, chain controller and iterator.
//! - **error** — [`LedgerError`], the error callers see.
//!
//! ## Example
//!
//! ```no_run
//! use pow_ledger::{Blockchain, LedgerResult};
//!
//! fn run() -> LedgerResult<()> {
//!     let mut chain = Blockchain::initialize("./ledger-db")?;
//!     chain.add_block("Send 1 BTC to Ivan")?;
//!     for block in chain.iter() {
//!         let block = block?;
//!         println!("{} <- {}", block.hash_hex(), block.previous_hash_hex());
//!     }
//!     chain.close()
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod pow;
pub mod storage;

pub use config::{ChainConfig, MiningMode};
pub use crypto::BlockHash;
pub use error::{LedgerError, LedgerResult};
pub use pow::{PowError, ProofOfWork};
pub use storage::{Block, Blockchain, BlockchainIterator};
