//! # Proof-of-Work Engine
//!
//! Finds the smallest nonce for which `SHA-256(header)` read as a big-endian
//! 256-bit integer is strictly below `target = 2^(256 - difficulty_bits)`.
//!
//! Because the target is an exact power of two, the comparison is a plain
//! lexicographic comparison of two 32-byte arrays. No bignum arithmetic.
//!
//! The engine does no I/O. It is the dominant cost of appending a block and
//! it blocks the calling thread until it finds a nonce, exhausts its bound,
//! or (for [`ProofOfWork::run_cancellable`]) is told to stop.
//!
//! ## Scan strategies
//!
//! - [`ProofOfWork::run`] — linear scan from 0. Deterministic.
//! - [`ProofOfWork::run_cancellable`] — same scan, polls an `AtomicBool`.
//! - [`ProofOfWork::run_parallel`] — rayon over fixed-size chunks in ascending
//!   order, `find_first` within a chunk. Returns the same nonce as `run`.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{
    validate_difficulty, ChainConfig, ConfigError, MiningMode, CANCEL_CHECK_INTERVAL,
    HASH_LENGTH, PARALLEL_CHUNK_SIZE,
};
use crate::crypto::hash::{sha256_array, BlockHash};
use crate::storage::block::{Block, BlockCandidate};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur while mining.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PowError {
    /// Every nonce up to and including `max_nonce` was tried without success.
    #[error("nonce space exhausted: no hash below target for nonces 0..={max_nonce}")]
    Exhausted { max_nonce: u64 },

    /// The caller raised the cancel flag.
    #[error("mining cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type PowResult<T> = Result<T, PowError>;

// ---------------------------------------------------------------------------
// Target Arithmetic
// ---------------------------------------------------------------------------

/// `2^(256 - difficulty_bits)` as a big-endian 32-byte integer.
///
/// Only meaningful for `difficulty_bits` in `1..=255`; callers validate first.
pub fn target_for(difficulty_bits: u32) -> BlockHash {
    let mut target = [0u8; HASH_LENGTH];
    let exponent = 256u32.saturating_sub(difficulty_bits).min(255) as usize;
    target[HASH_LENGTH - 1 - exponent / 8] = 1 << (exponent % 8);
    target
}

/// Does `hash` fall strictly below the target for `difficulty_bits`?
///
/// Out-of-range difficulties never validate.
pub fn meets_target(hash: &BlockHash, difficulty_bits: u32) -> bool {
    validate_difficulty(difficulty_bits).is_ok() && *hash < target_for(difficulty_bits)
}

/// Hash the preimage after writing `nonce` into its last 8 bytes.
fn hash_with_nonce(preimage: &mut [u8], nonce: u64) -> BlockHash {
    let split = preimage.len() - 8;
    preimage[split..].copy_from_slice(&nonce.to_be_bytes());
    sha256_array(preimage)
}

// ---------------------------------------------------------------------------
// Solution
// ---------------------------------------------------------------------------

/// A nonce together with the hash it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solution {
    pub nonce: u64,
    pub hash: BlockHash,
    pub difficulty_bits: u32,
}

// ---------------------------------------------------------------------------
// ProofOfWork
// ---------------------------------------------------------------------------

/// Nonce search at a fixed difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty_bits: u32,
    target: BlockHash,
    max_nonce: u64,
    mode: MiningMode,
}

impl ProofOfWork {
    /// Engine for `difficulty_bits`, scanning the full `u64` nonce space.
    pub fn new(difficulty_bits: u32) -> PowResult<Self> {
        validate_difficulty(difficulty_bits)?;
        Ok(Self {
            difficulty_bits,
            target: target_for(difficulty_bits),
            max_nonce: u64::MAX,
            mode: MiningMode::Sequential,
        })
    }

    /// Engine matching a chain's configuration.
    pub fn from_config(config: &ChainConfig) -> PowResult<Self> {
        Ok(Self::new(config.difficulty_bits())?.with_mode(config.mining_mode()))
    }

    /// Cap the scan at `max_nonce` (inclusive).
    pub fn with_max_nonce(mut self, max_nonce: u64) -> Self {
        self.max_nonce = max_nonce;
        self
    }

    /// Strategy used by [`ProofOfWork::seal`].
    pub fn with_mode(mut self, mode: MiningMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    pub fn target(&self) -> &BlockHash {
        &self.target
    }

    pub fn max_nonce(&self) -> u64 {
        self.max_nonce
    }

    pub fn mode(&self) -> MiningMode {
        self.mode
    }

    /// Target check at this engine's difficulty.
    pub fn is_valid_hash(&self, hash: &BlockHash) -> bool {
        *hash < self.target
    }

    /// Mine `candidate` with the configured strategy and return the finished block.
    pub fn seal(&self, candidate: BlockCandidate) -> PowResult<Block> {
        let solution = match self.mode {
            MiningMode::Sequential => self.run(&candidate)?,
            MiningMode::Parallel => self.run_parallel(&candidate)?,
        };
        Ok(candidate.seal(solution))
    }

    /// Linear scan from nonce 0.
    pub fn run(&self, candidate: &BlockCandidate) -> PowResult<Solution> {
        self.scan(candidate, None)
    }

    /// Linear scan that gives up with [`PowError::Cancelled`] once `cancel`
    /// is set. The flag is polled every `CANCEL_CHECK_INTERVAL` nonces.
    pub fn run_cancellable(
        &self,
        candidate: &BlockCandidate,
        cancel: &AtomicBool,
    ) -> PowResult<Solution> {
        self.scan(candidate, Some(cancel))
    }

    fn scan(&self, candidate: &BlockCandidate, cancel: Option<&AtomicBool>) -> PowResult<Solution> {
        let mut preimage = candidate.header_prefix(self.difficulty_bits);
        preimage.extend_from_slice(&[0u8; 8]);

        debug!(
            difficulty_bits = self.difficulty_bits,
            target = %hex::encode(self.target),
            "mining block"
        );

        let mut nonce = 0u64;
        loop {
            let hash = hash_with_nonce(&mut preimage, nonce);
            if self.is_valid_hash(&hash) {
                debug!(nonce, hash = %hex::encode(hash), "proof-of-work found");
                return Ok(self.solution(nonce, hash));
            }
            if nonce >= self.max_nonce {
                return Err(self.exhausted());
            }
            nonce += 1;

            if nonce % CANCEL_CHECK_INTERVAL == 0 {
                trace!(nonce, "mining progress");
                if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                    debug!(attempts = nonce, "mining cancelled");
                    return Err(PowError::Cancelled { attempts: nonce });
                }
            }
        }
    }

    /// Parallel scan over ascending chunks of `PARALLEL_CHUNK_SIZE` nonces.
    ///
    /// Within a chunk, `find_first` returns the lowest qualifying nonce, and a
    /// chunk is only started once every lower chunk came up empty. The result
    /// is therefore identical to [`ProofOfWork::run`].
    pub fn run_parallel(&self, candidate: &BlockCandidate) -> PowResult<Solution> {
        let mut template = candidate.header_prefix(self.difficulty_bits);
        template.extend_from_slice(&[0u8; 8]);

        debug!(
            difficulty_bits = self.difficulty_bits,
            threads = rayon::current_num_threads(),
            "mining block in parallel"
        );

        let mut start = 0u64;
        loop {
            let end = start
                .saturating_add(PARALLEL_CHUNK_SIZE - 1)
                .min(self.max_nonce);

            let found = (start..=end)
                .into_par_iter()
                .map_init(
                    || template.clone(),
                    |preimage, nonce| (nonce, hash_with_nonce(preimage, nonce)),
                )
                .find_first(|(_, hash)| self.is_valid_hash(hash));

            if let Some((nonce, hash)) = found {
                debug!(nonce, hash = %hex::encode(hash), "proof-of-work found");
                return Ok(self.solution(nonce, hash));
            }
            if end >= self.max_nonce {
                return Err(self.exhausted());
            }
            trace!(next = end + 1, "chunk exhausted");
            start = end + 1;
        }
    }

    /// Re-check a finished block against this engine's difficulty.
    pub fn validate(&self, block: &Block) -> bool {
        block.difficulty_bits() == self.difficulty_bits
            && block.compute_hash() == *block.hash()
            && self.is_valid_hash(block.hash())
    }

    fn solution(&self, nonce: u64, hash: BlockHash) -> Solution {
        Solution {
            nonce,
            hash,
            difficulty_bits: self.difficulty_bits,
        }
    }

    fn exhausted(&self) -> PowError {
        debug!(max_nonce = self.max_nonce, "nonce space exhausted");
        PowError::Exhausted {
            max_nonce: self.max_nonce,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
