//! # LedgerDB — Persistent Storage Engine
//!
//! The persistence layer of the ledger, built on sled's embedded key-value
//! store. All on-disk data flows through this module.
//!
//! ## Tree Layout
//!
//! Everything lives in a single named tree:
//!
//! | Tree     | Key                  | Value                    |
//! |----------|----------------------|--------------------------|
//! | `blocks` | block `hash` (32B)   | `codec::encode(Block)`   |
//! | `blocks` | `TIP_KEY` (`b"l"`)   | tip hash (32B)           |
//!
//! The tip key is one byte long, so it can never shadow a block.
//!
//! ## Atomicity
//!
//! Appending a block writes the block record and the new tip in a single
//! `Batch` applied to the `blocks` tree. sled applies a batch atomically:
//! a reader (or a restart after a crash) sees both writes or neither. The
//! database is flushed after every commit so a returned `Ok` means durable.
//!
//! ## Handles
//!
//! sled holds an exclusive lock on the store directory. `LedgerDB::open`
//! therefore keeps a process-wide registry of live stores keyed by their
//! canonical path: opening a path that is already open returns another
//! handle to the same store, and every handle sees the same data. The lock is
//! released when the last handle is closed or dropped.
//!
//! sled's background flusher is disabled. Every commit flushes on its own,
//! and a flusher thread would keep the store (and its lock) alive for a
//! moment after the last handle went away.

use parking_lot::{const_mutex, Mutex};
use sled::{Batch, Db, Tree};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::config::{BLOCKS_TREE, TIP_KEY};
use crate::crypto::hash::{hash_from_slice, BlockHash};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("tip entry is {len} bytes, expected 32")]
    CorruptTip { len: usize },
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Open Store Registry
// ---------------------------------------------------------------------------

/// Stores currently open in this process, by canonical path.
static OPEN_STORES: Mutex<BTreeMap<PathBuf, Weak<Store>>> = const_mutex(BTreeMap::new());

/// State shared by every handle on one store.
#[derive(Debug)]
struct Store {
    /// The underlying sled database handle.
    db: Db,
    /// Block records keyed by hash, plus the tip sentinel.
    blocks: Tree,
    /// Makes the next flush fail, to exercise commit error paths.
    #[cfg(test)]
    fail_next_flush: std::sync::atomic::AtomicBool,
}

// ---------------------------------------------------------------------------
// LedgerDB
// ---------------------------------------------------------------------------

/// Durable `hash → block record` mapping plus the tip pointer.
#[derive(Debug, Clone)]
pub struct LedgerDB {
    store: Arc<Store>,
}

impl LedgerDB {
    /// Open the store at `path`, creating it if it does not exist.
    ///
    /// If the path is already open in this process, the returned handle
    /// shares the existing store.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref();
        let mut registry = OPEN_STORES.lock();

        if let Some(store) = path
            .canonicalize()
            .ok()
            .and_then(|key| registry.get(&key))
            .and_then(Weak::upgrade)
        {
            debug!(path = %path.display(), "ledger store already open, sharing handle");
            return Ok(Self { store });
        }

        debug!(path = %path.display(), "opening ledger store");
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(None)
            .open()?;
        let handle = Self::from_db(db)?;

        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        registry.retain(|_, store| store.strong_count() > 0);
        registry.insert(key, Arc::downgrade(&handle.store));
        Ok(handle)
    }

    /// Create a store that lives in a temporary location and is removed
    /// when the last handle is dropped. Meant for tests.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true).flush_every_ms(None);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        Ok(Self {
            store: Arc::new(Store {
                db,
                blocks,
                #[cfg(test)]
                fail_next_flush: Default::default(),
            }),
        })
    }

    /// Point lookup in the `blocks` tree.
    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.store.blocks.get(key)?.map(|value| value.to_vec()))
    }

    /// Encoded record of the block with the given hash.
    pub fn get_block_bytes(&self, hash: &BlockHash) -> DbResult<Option<Vec<u8>>> {
        self.get(hash)
    }

    /// Current durable tip, or `None` for a fresh store.
    pub fn get_tip(&self) -> DbResult<Option<BlockHash>> {
        match self.store.blocks.get(TIP_KEY)? {
            Some(bytes) => {
                let tip = hash_from_slice(&bytes).ok_or_else(|| {
                    warn!(len = bytes.len(), "tip entry has unexpected length");
                    DbError::CorruptTip { len: bytes.len() }
                })?;
                Ok(Some(tip))
            }
            None => Ok(None),
        }
    }

    /// True when nothing has ever been committed to this store.
    pub fn is_empty(&self) -> bool {
        self.store.blocks.is_empty()
    }

    /// Store `block_hash → block_bytes` and move the tip to `new_tip`
    /// atomically, then flush.
    ///
    /// If the flush fails the batch has already been applied: the new record
    /// and tip are visible but may not be on disk yet.
    pub fn commit_new_block(
        &self,
        block_hash: &BlockHash,
        block_bytes: &[u8],
        new_tip: &BlockHash,
    ) -> DbResult<()> {
        let mut batch = Batch::default();
        batch.insert(block_hash.as_slice(), block_bytes);
        batch.insert(TIP_KEY, new_tip.as_slice());
        self.store.blocks.apply_batch(batch)?;

        self.flush()?;

        debug!(
            hash = %hex::encode(block_hash),
            bytes = block_bytes.len(),
            "block record committed"
        );
        Ok(())
    }

    /// Number of block records (the tip sentinel is not counted).
    pub fn block_count(&self) -> DbResult<usize> {
        let with_tip = self.store.blocks.len();
        Ok(if self.store.blocks.contains_key(TIP_KEY)? {
            with_tip - 1
        } else {
            with_tip
        })
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        #[cfg(test)]
        if self
            .store
            .fail_next_flush
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(DbError::Sled(sled::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected flush failure",
            ))));
        }

        self.store.db.flush()?;
        Ok(())
    }

    /// Direct access to the tree, for tests that corrupt the store on purpose.
    #[cfg(test)]
    pub(crate) fn tree(&self) -> &Tree {
        &self.store.blocks
    }

    /// Make the next [`LedgerDB::flush`] on this store fail.
    #[cfg(test)]
    pub(crate) fn fail_next_flush(&self) {
        self.store
            .fail_next_flush
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Flush and release this handle. The file lock goes away once every
    /// handle on the store has been closed or dropped.
    pub fn close(self) -> DbResult<()> {
        self.flush()?;
        debug!("ledger store handle closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
