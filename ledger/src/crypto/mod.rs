//! # Cryptographic Primitives
//!
//! A thin, type-safe wrapper around the audited `sha2` implementation.
//! Nothing here is clever on purpose.

pub mod hash;

pub use hash::{hash_from_slice, sha256, sha256_array, BlockHash};
