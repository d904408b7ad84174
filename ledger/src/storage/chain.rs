//! # Blockchain Controller
//!
//! Owns the store handle and an in-memory copy of the tip. Appending a block
//! reads the cached tip, mines a block on top of it, commits block and tip in
//! one batch and only then moves the cached tip forward. If mining fails,
//! the cached tip and the store are left exactly as they were. If the commit
//! fails, the cached tip is re-read from the store so it never falls behind a
//! batch that was applied before the flush failed.
//!
//! The chain runs at one difficulty. Every block read back (by the iterator,
//! [`Blockchain::verify_chain`], or when opening the store) must have been
//! mined at that difficulty; anything else is an integrity error.
//!
//! `add_block` takes `&mut self`, so a single `Blockchain` can never run two
//! appends at once. Callers sharing a chain across threads wrap it in a lock.

use std::iter::FusedIterator;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::ChainConfig;
use crate::crypto::hash::BlockHash;
use crate::error::{LedgerError, LedgerResult};
use crate::pow::ProofOfWork;
use crate::storage::block::{Block, BlockCandidate};
use crate::storage::codec;
use crate::storage::db::LedgerDB;

// ---------------------------------------------------------------------------
// Blockchain
// ---------------------------------------------------------------------------

/// A persisted, proof-of-work gated chain of blocks.
#[derive(Debug)]
pub struct Blockchain {
    /// Durable store. Owns the file lock.
    db: LedgerDB,
    /// Cache of the durable tip.
    tip: BlockHash,
    /// Nonce search used for every new block.
    pow: ProofOfWork,
    config: ChainConfig,
}

impl Blockchain {
    /// Open the chain at `path` with the default configuration, mining the
    /// genesis block if the store is empty.
    pub fn initialize<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        Self::initialize_with(path, ChainConfig::default())
    }

    /// Same as [`Blockchain::initialize`] with an explicit configuration.
    pub fn initialize_with<P: AsRef<Path>>(path: P, config: ChainConfig) -> LedgerResult<Self> {
        let db = LedgerDB::open(path)?;
        Self::from_db(db, config)
    }

    /// Chain on a throwaway store. Meant for tests.
    pub fn open_temporary(config: ChainConfig) -> LedgerResult<Self> {
        Self::from_db(LedgerDB::open_temporary()?, config)
    }

    /// Build the controller on an already opened store.
    pub fn from_db(db: LedgerDB, config: ChainConfig) -> LedgerResult<Self> {
        let pow = ProofOfWork::from_config(&config)?;

        let tip = match db.get_tip()? {
            Some(tip) => {
                load_block(&db, &pow, &tip)?;
                info!(tip = %hex::encode(tip), "opened existing chain");
                tip
            }
            None if !db.is_empty() => {
                return Err(LedgerError::Integrity {
                    hash: "tip".to_string(),
                    reason: "store holds block records but no tip".to_string(),
                });
            }
            None => {
                info!(
                    difficulty_bits = config.difficulty_bits(),
                    "empty store, mining genesis block"
                );
                let genesis = Block::new_genesis_block(&pow)?;
                commit(&db, &genesis)?;
                info!(
                    hash = %genesis.hash_hex(),
                    nonce = genesis.nonce(),
                    "genesis block committed"
                );
                *genesis.hash()
            }
        };

        Ok(Self {
            db,
            tip,
            pow,
            config,
        })
    }

    /// Mine a block carrying `data` on top of the current tip and commit it.
    ///
    /// Returns the committed block. A mining error changes nothing. A commit
    /// error leaves the cached tip equal to whatever tip the store holds.
    pub fn add_block(&mut self, data: impl Into<Vec<u8>>) -> LedgerResult<Block> {
        let candidate = BlockCandidate::new(data.into(), Some(self.tip));
        debug!(
            previous = %hex::encode(self.tip),
            bytes = candidate.data().len(),
            "mining new block"
        );

        let block = self.pow.seal(candidate)?;
        if let Err(e) = commit(&self.db, &block) {
            self.resync_tip();
            return Err(e);
        }
        self.tip = *block.hash();

        info!(
            hash = %block.hash_hex(),
            previous = %block.previous_hash_hex(),
            nonce = block.nonce(),
            "block committed"
        );
        Ok(block)
    }

    /// Reload the cached tip after a failed commit.
    fn resync_tip(&mut self) {
        match self.db.get_tip() {
            Ok(Some(tip)) if tip != self.tip => {
                warn!(
                    cached = %hex::encode(self.tip),
                    stored = %hex::encode(tip),
                    "commit failed after the batch was applied, following stored tip"
                );
                self.tip = tip;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not re-read tip after failed commit"),
        }
    }

    /// Hash of the most recently appended block.
    pub fn tip(&self) -> &BlockHash {
        &self.tip
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Look up and decode a stored block.
    pub fn get_block(&self, hash: &BlockHash) -> LedgerResult<Option<Block>> {
        match self.db.get_block_bytes(hash)? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The block the tip points at.
    pub fn tip_block(&self) -> LedgerResult<Block> {
        load_block(&self.db, &self.pow, &self.tip)
    }

    /// Number of blocks reachable from the tip, genesis included. Counted by
    /// walking the chain on every call.
    pub fn height(&self) -> LedgerResult<usize> {
        self.iter().try_fold(0usize, |count, block| block.map(|_| count + 1))
    }

    /// Number of stored blocks, genesis included.
    pub fn block_count(&self) -> LedgerResult<usize> {
        Ok(self.db.block_count()?)
    }

    /// Walk from the current tip back to genesis. Blocks appended after this
    /// call are not visited.
    pub fn iter(&self) -> BlockchainIterator {
        BlockchainIterator {
            db: self.db.clone(),
            pow: self.pow,
            cursor: Some(self.tip),
        }
    }

    /// Walk the whole chain and check every block: record decodes, hash and
    /// proof-of-work verify at the chain's difficulty, the record sits under
    /// its own hash, and the walk ends at a genesis block. Returns the number of blocks checked.
    pub fn verify_chain(&self) -> LedgerResult<usize> {
        let mut count = 0usize;
        let mut last: Option<Block> = None;
        for block in self.iter() {
            let block = block?;
            count += 1;
            last = Some(block);
        }

        match last {
            Some(genesis) if genesis.is_genesis() => {
                debug!(blocks = count, "chain verified");
                Ok(count)
            }
            _ => Err(LedgerError::Integrity {
                hash: hex::encode(self.tip),
                reason: "walk did not end at a genesis block".to_string(),
            }),
        }
    }

    /// Flush and release the store.
    pub fn close(self) -> LedgerResult<()> {
        info!(tip = %hex::encode(self.tip), "closing chain");
        self.db.close()?;
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Blockchain {
    type Item = LedgerResult<Block>;
    type IntoIter = BlockchainIterator;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn commit(db: &LedgerDB, block: &Block) -> LedgerResult<()> {
    let bytes = codec::encode(block);
    db.commit_new_block(block.hash(), &bytes, block.hash())?;
    Ok(())
}

fn load_block(db: &LedgerDB, pow: &ProofOfWork, hash: &BlockHash) -> LedgerResult<Block> {
    let bytes = db
        .get_block_bytes(hash)?
        .ok_or_else(|| LedgerError::MissingBlock(hex::encode(hash)))?;
    let block = codec::decode(&bytes)?;
    if block.hash() != hash {
        return Err(LedgerError::Integrity {
            hash: hex::encode(hash),
            reason: format!("record holds block {}", block.hash_hex()),
        });
    }
    if !pow.validate(&block) {
        warn!(
            hash = %block.hash_hex(),
            difficulty_bits = block.difficulty_bits(),
            "stored block mined at foreign difficulty"
        );
        return Err(LedgerError::Integrity {
            hash: block.hash_hex(),
            reason: format!(
                "mined at difficulty {}, chain requires {}",
                block.difficulty_bits(),
                pow.difficulty_bits()
            ),
        });
    }
    Ok(block)
}

// ---------------------------------------------------------------------------
// BlockchainIterator
// ---------------------------------------------------------------------------

/// Newest-to-oldest walk over a snapshot of the chain.
///
/// Yields `Err` at most once (unreadable or missing record) and then stops.
/// Not restartable; call [`Blockchain::iter`] again for a fresh walk.
#[derive(Debug, Clone)]
pub struct BlockchainIterator {
    db: LedgerDB,
    pow: ProofOfWork,
    cursor: Option<BlockHash>,
}

impl Iterator for BlockchainIterator {
    type Item = LedgerResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.cursor.take()?;
        match load_block(&self.db, &self.pow, &hash) {
            Ok(block) => {
                self.cursor = block.previous_hash().copied();
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl FusedIterator for BlockchainIterator {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MiningMode, GENESIS_DATA};
    use crate::pow::{PowError, ProofOfWork};

    fn test_config() -> ChainConfig {
        ChainConfig::new(8).unwrap()
    }

    fn collect(chain: &Blockchain) -> Vec<Block> {
        chain.iter().collect::<LedgerResult<Vec<_>>>().unwrap()
    }

    #[test]
    fn fresh_store_gets_a_genesis_block() {
        let chain = Blockchain::open_temporary(test_config()).unwrap();
        let genesis = chain.tip_block().unwrap();

        assert!(genesis.is_genesis());
        assert_eq!(genesis.data(), GENESIS_DATA);
        assert_eq!(genesis.hash(), chain.tip());
        assert!(genesis.verify().is_ok());
        assert_eq!(chain.block_count().unwrap(), 1);
    }

    #[test]
    fn add_block_links_to_previous_tip() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        let before = *chain.tip();

        let block = chain.add_block(b"A".to_vec()).unwrap();

        assert_eq!(block.previous_hash(), Some(&before));
        assert_eq!(chain.tip(), block.hash());
        assert_eq!(block.data(), b"A");
        assert_eq!(block.hash()[0], 0, "8-bit difficulty");
        assert_eq!(chain.get_block(block.hash()).unwrap(), Some(block));
    }

    #[test]
    fn iterator_walks_newest_first() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        chain.add_block("A").unwrap();
        chain.add_block("B").unwrap();

        let blocks = collect(&chain);
        let payloads: Vec<&[u8]> = blocks.iter().map(|b| b.data()).collect();
        assert_eq!(payloads, vec![&b"B"[..], &b"A"[..], GENESIS_DATA]);

        for pair in blocks.windows(2) {
            assert_eq!(pair[0].previous_hash(), Some(pair[1].hash()));
        }
        assert!(blocks.last().unwrap().is_genesis());
    }

    #[test]
    fn iterator_is_a_snapshot() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        chain.add_block("first").unwrap();

        let iter = chain.iter();
        chain.add_block("second").unwrap();

        let seen: Vec<Block> = iter.map(Result::unwrap).collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].data(), b"first");
    }

    #[test]
    fn iterator_is_fused() {
        let chain = Blockchain::open_temporary(test_config()).unwrap();
        let mut iter = chain.iter();
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn into_iterator_for_reference() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        chain.add_block("x").unwrap();
        let mut count = 0;
        for block in &chain {
            block.unwrap();
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn failed_mining_leaves_chain_untouched() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        chain.add_block("kept").unwrap();
        let tip = *chain.tip();

        // Swap in an engine that cannot succeed.
        chain.pow = ProofOfWork::new(255).unwrap().with_max_nonce(10);
        let err = chain.add_block("lost").unwrap_err();

        assert!(err.is_mining_exhausted());
        assert!(matches!(
            err,
            LedgerError::Mining(PowError::Exhausted { max_nonce: 10 })
        ));
        assert_eq!(chain.tip(), &tip);
        assert_eq!(chain.db.get_tip().unwrap(), Some(tip));
        assert_eq!(chain.block_count().unwrap(), 2);
    }

    #[test]
    fn parallel_mining_produces_valid_chain() {
        let config = test_config().with_mining_mode(MiningMode::Parallel);
        let mut chain = Blockchain::open_temporary(config).unwrap();
        chain.add_block("p1").unwrap();
        chain.add_block("p2").unwrap();
        assert_eq!(chain.verify_chain().unwrap(), 3);
    }

    #[test]
    fn verify_chain_counts_blocks() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        for i in 0..5u8 {
            chain.add_block(vec![i]).unwrap();
        }
        assert_eq!(chain.verify_chain().unwrap(), 6);
    }

    #[test]
    fn missing_link_is_reported_once() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        let first = chain.add_block("first").unwrap();
        chain.add_block("second").unwrap();

        // Drop the middle record behind the controller's back.
        chain.db.tree().remove(first.hash()).unwrap();

        let results: Vec<_> = chain.iter().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(LedgerError::MissingBlock(_))));
        assert!(chain.verify_chain().is_err());
    }

    #[test]
    fn record_under_wrong_key_is_an_integrity_error() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        let a = chain.add_block("a").unwrap();
        let b = chain.add_block("b").unwrap();

        // Store b's record under a's key.
        chain.db.tree().insert(a.hash(), codec::encode(&b)).unwrap();

        let err = chain.verify_chain().unwrap_err();
        assert!(matches!(err, LedgerError::Integrity { .. }));
    }

    #[test]
    fn records_without_tip_are_rejected() {
        let db = LedgerDB::open_temporary().unwrap();
        db.tree().insert([1u8; 32], &b"orphan"[..]).unwrap();
        let err = Blockchain::from_db(db, test_config()).unwrap_err();
        assert!(matches!(err, LedgerError::Integrity { .. }));
    }

    #[test]
    fn block_at_foreign_difficulty_is_rejected() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        chain.add_block("honest").unwrap();

        // Cheap block sealed at 1 bit and committed on top of the tip.
        let candidate = BlockCandidate::new(b"forged".to_vec(), Some(*chain.tip()));
        let forged = ProofOfWork::new(1).unwrap().seal(candidate).unwrap();
        assert!(forged.verify().is_ok(), "valid on its own terms");
        commit(&chain.db, &forged).unwrap();
        chain.tip = *forged.hash();

        let results: Vec<_> = chain.iter().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(LedgerError::Integrity { .. })));
        assert!(chain.verify_chain().is_err());
        assert!(chain.height().is_err());

        let reopened = Blockchain::from_db(chain.db.clone(), test_config());
        assert!(matches!(reopened, Err(LedgerError::Integrity { .. })));
    }

    #[test]
    fn opening_with_another_difficulty_is_rejected() {
        let chain = Blockchain::open_temporary(test_config()).unwrap();
        let err = Blockchain::from_db(chain.db.clone(), ChainConfig::new(9).unwrap()).unwrap_err();
        assert!(matches!(err, LedgerError::Integrity { .. }));

        assert!(Blockchain::from_db(chain.db.clone(), test_config()).is_ok());
    }

    #[test]
    fn failed_flush_keeps_cached_tip_in_step_with_store() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        chain.add_block("a").unwrap();

        chain.db.fail_next_flush();
        let err = chain.add_block("x").unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(Some(*chain.tip()), chain.db.get_tip().unwrap());

        chain.add_block("y").unwrap();
        let payloads: Vec<Vec<u8>> = chain
            .iter()
            .map(|b| b.unwrap().data().to_vec())
            .collect();
        assert_eq!(
            payloads,
            vec![b"y".to_vec(), b"x".to_vec(), b"a".to_vec(), GENESIS_DATA.to_vec()]
        );
        assert_eq!(chain.verify_chain().unwrap(), 4);
    }

    #[test]
    fn height_counts_reachable_blocks() {
        let mut chain = Blockchain::open_temporary(test_config()).unwrap();
        assert_eq!(chain.height().unwrap(), 1);
        chain.add_block("one").unwrap();
        chain.add_block("two").unwrap();
        assert_eq!(chain.height().unwrap(), 3);
        assert_eq!(chain.height().unwrap(), chain.block_count().unwrap());
    }
}
