/// Persistent liveness storage
/// 
/// Holds what a validator must not forget across a restart: its safety
/// data, the highest certificates it has seen, and the uncommitted part
/// of the block tree. Committed history belongs to the ledger.

use crate::hotstuff::block::Block;
use crate::hotstuff::quorum_cert::{QuorumCert, TimeoutCertificate};
use crate::hotstuff::safety_rules::SafetyData;
use crate::hotstuff::types::BlockId;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStorage;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Everything needed to rebuild the block store and safety rules
#[derive(Clone, Debug)]
pub struct RecoveryData {
    pub safety_data: Option<SafetyData>,
    pub root: Block,
    pub root_qc: QuorumCert,
    /// Uncommitted blocks above the root, in no particular order
    pub blocks: Vec<Block>,
    pub highest_qc: QuorumCert,
    pub highest_commit_qc: QuorumCert,
    pub highest_timeout_cert: Option<TimeoutCertificate>,
}

pub trait PersistentLivenessStorage: Send + Sync {
    fn save_safety_data(&self, data: &SafetyData) -> Result<()>;

    fn save_highest_certs(
        &self,
        highest_qc: &QuorumCert,
        highest_commit_qc: &QuorumCert,
        highest_timeout_cert: Option<&TimeoutCertificate>,
    ) -> Result<()>;

    fn save_blocks(&self, blocks: &[Block]) -> Result<()>;

    fn prune_blocks(&self, ids: &[BlockId]) -> Result<()>;

    /// Record the committed root and the QC certifying it
    fn save_root(&self, root: &Block, root_qc: &QuorumCert) -> Result<()>;

    /// `None` when nothing has been persisted yet
    fn recover(&self) -> Result<Option<RecoveryData>>;

    /// Drop the tree and certificates of a finished epoch and start over
    /// from the new epoch's genesis
    fn reset_for_epoch(&self, safety_data: &SafetyData, root: &Block, root_qc: &QuorumCert)
        -> Result<()>;
}

/// Column family names
const CF_BLOCKS: &str = "blocks";
const CF_METADATA: &str = "metadata";

/// Metadata keys
const KEY_SAFETY_DATA: &[u8] = b"safety_data";
const KEY_HIGHEST_QC: &[u8] = b"highest_qc";
const KEY_HIGHEST_COMMIT_QC: &[u8] = b"highest_commit_qc";
const KEY_HIGHEST_TC: &[u8] = b"highest_timeout_cert";
const KEY_ROOT: &[u8] = b"root";
const KEY_ROOT_QC: &[u8] = b"root_qc";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
}

/// RocksDB-backed liveness storage
pub struct ConsensusDB {
    db: Arc<DB>,
    // Keeps a temporary directory alive for the lifetime of the handle
    _temp_dir: Option<TempDir>,
}

impl ConsensusDB {
    /// Open (or create) the database at `path`
    pub fn new(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            _temp_dir: None,
        })
    }

    /// Database in a fresh temporary directory, removed on drop
    pub fn new_temp() -> Result<Self> {
        let temp_dir = tempfile::tempdir().map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let mut db = Self::new(temp_dir.path())?;
        db._temp_dir = Some(temp_dir);
        Ok(db)
    }

    fn get_cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::InvalidData(format!("Column family not found: {}", name)))
    }

    fn get_metadata<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        let cf = self.get_cf(CF_METADATA)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_metadata<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let cf = self.get_cf(CF_METADATA)?;
        self.db.put_cf(cf, key, encode(value)?)?;
        Ok(())
    }

    fn all_blocks(&self) -> Result<Vec<Block>> {
        let cf = self.get_cf(CF_BLOCKS)?;
        let mut blocks = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            blocks.push(decode(&value)?);
        }
        Ok(blocks)
    }
}

impl PersistentLivenessStorage for ConsensusDB {
    fn save_safety_data(&self, data: &SafetyData) -> Result<()> {
        self.put_metadata(KEY_SAFETY_DATA, data)
    }

    fn save_highest_certs(
        &self,
        highest_qc: &QuorumCert,
        highest_commit_qc: &QuorumCert,
        highest_timeout_cert: Option<&TimeoutCertificate>,
    ) -> Result<()> {
        let cf = self.get_cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, KEY_HIGHEST_QC, encode(highest_qc)?);
        batch.put_cf(cf, KEY_HIGHEST_COMMIT_QC, encode(highest_commit_qc)?);
        match highest_timeout_cert {
            Some(tc) => batch.put_cf(cf, KEY_HIGHEST_TC, encode(tc)?),
            None => batch.delete_cf(cf, KEY_HIGHEST_TC),
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn save_blocks(&self, blocks: &[Block]) -> Result<()> {
        let cf = self.get_cf(CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        for block in blocks {
            batch.put_cf(cf, block.id().as_bytes(), encode(block)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn prune_blocks(&self, ids: &[BlockId]) -> Result<()> {
        let cf = self.get_cf(CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(cf, id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn save_root(&self, root: &Block, root_qc: &QuorumCert) -> Result<()> {
        let cf = self.get_cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, KEY_ROOT, encode(root)?);
        batch.put_cf(cf, KEY_ROOT_QC, encode(root_qc)?);
        self.db.write(batch)?;
        Ok(())
    }

    fn recover(&self) -> Result<Option<RecoveryData>> {
        let root: Block = match self.get_metadata(KEY_ROOT)? {
            Some(root) => root,
            None => return Ok(None),
        };
        let root_qc: QuorumCert = self
            .get_metadata(KEY_ROOT_QC)?
            .ok_or_else(|| StorageError::InvalidData("root without root QC".into()))?;
        let highest_qc = self.get_metadata(KEY_HIGHEST_QC)?.unwrap_or_else(|| root_qc.clone());
        let highest_commit_qc = self
            .get_metadata(KEY_HIGHEST_COMMIT_QC)?
            .unwrap_or_else(|| root_qc.clone());
        let blocks = self
            .all_blocks()?
            .into_iter()
            .filter(|b| b.id() != root.id())
            .collect();

        Ok(Some(RecoveryData {
            safety_data: self.get_metadata(KEY_SAFETY_DATA)?,
            root,
            root_qc,
            blocks,
            highest_qc,
            highest_commit_qc,
            highest_timeout_cert: self.get_metadata(KEY_HIGHEST_TC)?,
        }))
    }

    fn reset_for_epoch(
        &self,
        safety_data: &SafetyData,
        root: &Block,
        root_qc: &QuorumCert,
    ) -> Result<()> {
        let ids: Vec<BlockId> = self.all_blocks()?.iter().map(|b| b.id()).collect();
        self.prune_blocks(&ids)?;

        let cf = self.get_cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, KEY_SAFETY_DATA, encode(safety_data)?);
        batch.put_cf(cf, KEY_ROOT, encode(root)?);
        batch.put_cf(cf, KEY_ROOT_QC, encode(root_qc)?);
        batch.put_cf(cf, KEY_HIGHEST_QC, encode(root_qc)?);
        batch.put_cf(cf, KEY_HIGHEST_COMMIT_QC, encode(root_qc)?);
        batch.delete_cf(cf, KEY_HIGHEST_TC);
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::test_utils::TestCommittee;

    #[test]
    fn test_empty_database_recovers_nothing() {
        let db = ConsensusDB::new_temp().unwrap();
        assert!(db.recover().unwrap().is_none());
    }

    #[test]
    fn test_round_trip_recovery_data() {
        let committee = TestCommittee::new(4);
        let db = ConsensusDB::new_temp().unwrap();
        let genesis = committee.genesis();
        let (blocks, qcs) = committee.certified_chain(2);

        db.save_root(genesis, genesis.quorum_cert()).unwrap();
        db.save_blocks(&blocks).unwrap();
        db.save_highest_certs(&qcs[1], genesis.quorum_cert(), None).unwrap();
        let mut safety = SafetyData::new(1);
        safety.last_voted_round = 2;
        db.save_safety_data(&safety).unwrap();

        let recovered = db.recover().unwrap().unwrap();
        assert_eq!(recovered.root.id(), genesis.id());
        assert_eq!(recovered.blocks.len(), 2);
        assert_eq!(recovered.highest_qc, qcs[1]);
        assert_eq!(recovered.safety_data, Some(safety));
        assert!(recovered.highest_timeout_cert.is_none());
    }

    #[test]
    fn test_prune_blocks() {
        let committee = TestCommittee::new(4);
        let db = ConsensusDB::new_temp().unwrap();
        let genesis = committee.genesis();
        let (blocks, _) = committee.certified_chain(3);

        db.save_root(genesis, genesis.quorum_cert()).unwrap();
        db.save_blocks(&blocks).unwrap();
        db.prune_blocks(&[blocks[0].id()]).unwrap();

        let recovered = db.recover().unwrap().unwrap();
        assert_eq!(recovered.blocks.len(), 2);
        assert!(recovered.blocks.iter().all(|b| b.id() != blocks[0].id()));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let committee = TestCommittee::new(4);
        let mut safety = SafetyData::new(1);
        safety.last_voted_round = 7;

        {
            let db = ConsensusDB::new(temp_dir.path()).unwrap();
            db.save_root(committee.genesis(), committee.genesis().quorum_cert()).unwrap();
            db.save_safety_data(&safety).unwrap();
        }
        {
            let db = ConsensusDB::new(temp_dir.path()).unwrap();
            let recovered = db.recover().unwrap().unwrap();
            assert_eq!(recovered.safety_data.unwrap().last_voted_round, 7);
        }
    }

    #[test]
    fn test_reset_for_epoch_clears_tree() {
        let committee = TestCommittee::new(4);
        let next = TestCommittee::with_epoch(4, 2);
        let db = ConsensusDB::new_temp().unwrap();
        let (blocks, qcs) = committee.certified_chain(2);
        let tc = committee.make_tc(3, &[0, 1, 2]);

        db.save_root(committee.genesis(), committee.genesis().quorum_cert()).unwrap();
        db.save_blocks(&blocks).unwrap();
        db.save_highest_certs(&qcs[1], committee.genesis().quorum_cert(), Some(&tc)).unwrap();

        let new_root = next.genesis();
        db.reset_for_epoch(&SafetyData::new(2), new_root, new_root.quorum_cert()).unwrap();

        let recovered = db.recover().unwrap().unwrap();
        assert_eq!(recovered.root.epoch(), 2);
        assert!(recovered.blocks.is_empty());
        assert_eq!(recovered.highest_qc, *new_root.quorum_cert());
        assert!(recovered.highest_timeout_cert.is_none());
        assert_eq!(recovered.safety_data, Some(SafetyData::new(2)));
    }
}
