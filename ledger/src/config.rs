//! # Ledger Configuration & Constants
//!
//! Every magic number in the ledger lives here. The on-disk layout, the
//! proof-of-work difficulty and the codec version all hang off these values,
//! so changing one of them after a store has been written means the old store
//! can no longer be read (or at least no longer verifies).

use thiserror::Error;

// ---------------------------------------------------------------------------
// Proof-of-Work
// ---------------------------------------------------------------------------

/// Default difficulty, in leading zero bits of the block hash.
///
/// A hash is valid when its big-endian integer value is strictly below
/// `2^(256 - DIFFICULTY_BITS)`. At 24 bits that takes ~16.7M SHA-256
/// evaluations on average, i.e. a few seconds on a laptop.
pub const DIFFICULTY_BITS: u32 = 24;

/// Smallest accepted difficulty. Zero would make every hash valid and the
/// target (`2^256`) would no longer fit in 32 bytes.
pub const MIN_DIFFICULTY_BITS: u32 = 1;

/// Largest accepted difficulty. At 256 the target collapses to `1`.
pub const MAX_DIFFICULTY_BITS: u32 = 255;

/// Number of nonces handed to the rayon pool per round of the parallel scan.
pub const PARALLEL_CHUNK_SIZE: u64 = 1 << 16;

/// How often (in nonces) the cancellable scan polls its stop flag.
pub const CANCEL_CHECK_INTERVAL: u64 = 1 << 12;

// ---------------------------------------------------------------------------
// Storage Layout
// ---------------------------------------------------------------------------

/// Name of the sled tree holding every block plus the tip pointer.
pub const BLOCKS_TREE: &str = "blocks";

/// Sentinel key of the tip entry. One byte long, so it can never collide
/// with a 32-byte block hash key.
pub const TIP_KEY: &[u8] = b"l";

/// Payload of the genesis block.
pub const GENESIS_DATA: &[u8] = b"Genesis Block";

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Version byte leading every encoded block record.
pub const CODEC_VERSION: u8 = 1;

/// Length of a SHA-256 digest.
pub const HASH_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// ChainConfig
// ---------------------------------------------------------------------------

/// Errors produced while validating a [`ChainConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("difficulty {bits} out of range [{min}, {max}]")]
    DifficultyOutOfRange { bits: u32, min: u32, max: u32 },
}

/// How the nonce space is scanned.
///
/// Both modes return the same nonce for the same header: the parallel scan
/// works through fixed-size chunks in ascending order and keeps the lowest
/// hit of the first chunk that has one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MiningMode {
    #[default]
    Sequential,
    Parallel,
}

/// Per-chain knobs.
///
/// Difficulty is fixed for the lifetime of a chain; there is no retargeting.
/// A store must be reopened with the difficulty it was created at. Tests
/// open chains at a low difficulty so mining stays in the microsecond range.
///
/// [`Blockchain`]: crate::storage::Blockchain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    difficulty_bits: u32,
    mining_mode: MiningMode,
}

impl ChainConfig {
    /// Build a config with an explicit difficulty.
    pub fn new(difficulty_bits: u32) -> Result<Self, ConfigError> {
        validate_difficulty(difficulty_bits)?;
        Ok(Self {
            difficulty_bits,
            mining_mode: MiningMode::default(),
        })
    }

    /// Switch the nonce scan strategy.
    pub fn with_mining_mode(mut self, mining_mode: MiningMode) -> Self {
        self.mining_mode = mining_mode;
        self
    }

    /// Difficulty new blocks are mined at.
    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    pub fn mining_mode(&self) -> MiningMode {
        self.mining_mode
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty_bits: DIFFICULTY_BITS,
            mining_mode: MiningMode::default(),
        }
    }
}

/// Check that `bits` lies in `[MIN_DIFFICULTY_BITS, MAX_DIFFICULTY_BITS]`.
pub fn validate_difficulty(bits: u32) -> Result<(), ConfigError> {
    if (MIN_DIFFICULTY_BITS..=MAX_DIFFICULTY_BITS).contains(&bits) {
        Ok(())
    } else {
        Err(ConfigError::DifficultyOutOfRange {
            bits,
            min: MIN_DIFFICULTY_BITS,
            max: MAX_DIFFICULTY_BITS,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_reference_difficulty() {
        assert_eq!(ChainConfig::default().difficulty_bits(), 24);
        assert_eq!(ChainConfig::default().mining_mode(), MiningMode::Sequential);
    }

    #[test]
    fn tip_key_cannot_collide_with_a_hash() {
        assert_ne!(TIP_KEY.len(), HASH_LENGTH);
    }

    #[test]
    fn difficulty_bounds_are_enforced() {
        assert!(ChainConfig::new(MIN_DIFFICULTY_BITS).is_ok());
        assert!(ChainConfig::new(MAX_DIFFICULTY_BITS).is_ok());
        assert_eq!(
            ChainConfig::new(0),
            Err(ConfigError::DifficultyOutOfRange {
                bits: 0,
                min: MIN_DIFFICULTY_BITS,
                max: MAX_DIFFICULTY_BITS,
            })
        );
        assert!(ChainConfig::new(256).is_err());
    }
}
