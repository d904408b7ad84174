//! # Block Codec
//!
//! Explicit, versioned binary layout for blocks at rest. Every integer is
//! big-endian, every variable-length field is length-prefixed, and decoding
//! consumes the input exactly.
//!
//! ```text
//! offset  size  field
//! 0       1     version (= CODEC_VERSION)
//! 1       8     timestamp        i64
//! 9       8     nonce            u64
//! 17      4     difficulty_bits  u32
//! 21      32    hash
//! 53      4     previous_hash length (0 or 32)
//! 57      n     previous_hash
//! 57+n    8     data length      u64
//! 65+n    m     data
//! ```
//!
//! Decoding never panics. Besides the structural checks, a decoded block must
//! pass [`Block::verify`]: a flipped bit anywhere in the record either breaks
//! the layout or breaks the hash, so corruption never comes back as a
//! different, valid-looking block.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::config::{CODEC_VERSION, HASH_LENGTH};
use crate::crypto::hash::{hash_from_slice, BlockHash};
use crate::storage::block::{Block, BlockVerifyError};

/// Size of the fixed-width part of a record, up to and including the
/// previous-hash length prefix.
const FIXED_HEADER_LEN: usize = 1 + 8 + 8 + 4 + HASH_LENGTH + 4;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// A byte sequence that does not decode to a well-formed block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated record: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unsupported codec version {0}")]
    UnsupportedVersion(u8),

    #[error("previous hash must be 0 or 32 bytes, got {0}")]
    InvalidPreviousHashLength(usize),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("decoded block failed verification: {0}")]
    Integrity(#[from] BlockVerifyError),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Serialize a block into its storage record.
pub fn encode(block: &Block) -> Vec<u8> {
    let previous_hash: &[u8] = block.previous_hash().map(|h| h.as_slice()).unwrap_or(&[]);
    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + previous_hash.len() + 8 + block.data().len());

    out.put_u8(CODEC_VERSION);
    out.put_i64(block.timestamp());
    out.put_u64(block.nonce());
    out.put_u32(block.difficulty_bits());
    out.put_slice(block.hash());
    out.put_u32(previous_hash.len() as u32);
    out.put_slice(previous_hash);
    out.put_u64(block.data().len() as u64);
    out.put_slice(block.data());
    out
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Parse a storage record back into a block.
pub fn decode(bytes: &[u8]) -> DecodeResult<Block> {
    let mut buf = bytes;

    ensure_remaining(&buf, FIXED_HEADER_LEN)?;
    let version = buf.get_u8();
    if version != CODEC_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let timestamp = buf.get_i64();
    let nonce = buf.get_u64();
    let difficulty_bits = buf.get_u32();
    let hash = take_hash(&mut buf)?;

    let previous_len = buf.get_u32() as usize;
    let previous_hash = match previous_len {
        0 => None,
        HASH_LENGTH => Some(take_hash(&mut buf)?),
        other => return Err(DecodeError::InvalidPreviousHashLength(other)),
    };

    ensure_remaining(&buf, 8)?;
    let data_len = usize::try_from(buf.get_u64()).unwrap_or(usize::MAX);
    ensure_remaining(&buf, data_len)?;
    let data = buf[..data_len].to_vec();
    buf.advance(data_len);

    if buf.has_remaining() {
        return Err(DecodeError::TrailingBytes(buf.remaining()));
    }

    let block = Block::from_parts(timestamp, data, previous_hash, hash, nonce, difficulty_bits);
    block.verify()?;
    Ok(block)
}

fn ensure_remaining(buf: &&[u8], needed: usize) -> DecodeResult<()> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take_hash(buf: &mut &[u8]) -> DecodeResult<BlockHash> {
    ensure_remaining(buf, HASH_LENGTH)?;
    let hash = hash_from_slice(&buf[..HASH_LENGTH]).ok_or(DecodeError::Truncated {
        needed: HASH_LENGTH,
        remaining: buf.remaining(),
    })?;
    buf.advance(HASH_LENGTH);
    Ok(hash)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
