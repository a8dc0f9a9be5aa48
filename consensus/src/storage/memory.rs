// In-memory liveness storage for tests and local simulation.

use super::{PersistentLivenessStorage, RecoveryData, Result, StorageError};
use crate::hotstuff::block::Block;
use crate::hotstuff::quorum_cert::{QuorumCert, TimeoutCertificate};
use crate::hotstuff::safety_rules::SafetyData;
use crate::hotstuff::types::BlockId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    safety_data: Option<SafetyData>,
    root: Option<(Block, QuorumCert)>,
    blocks: HashMap<BlockId, Block>,
    highest_qc: Option<QuorumCert>,
    highest_commit_qc: Option<QuorumCert>,
    highest_timeout_cert: Option<TimeoutCertificate>,
    fail_writes: bool,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn writable(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.fail_writes {
            return Err(StorageError::WriteFailed("storage unavailable".into()));
        }
        Ok(inner)
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn safety_data(&self) -> Option<SafetyData> {
        self.lock().safety_data.clone()
    }

    pub fn highest_qc(&self) -> Option<QuorumCert> {
        self.lock().highest_qc.clone()
    }

    pub fn highest_commit_qc(&self) -> Option<QuorumCert> {
        self.lock().highest_commit_qc.clone()
    }

    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }
}

impl PersistentLivenessStorage for MemoryStorage {
    fn save_safety_data(&self, data: &SafetyData) -> Result<()> {
        self.writable()?.safety_data = Some(data.clone());
        Ok(())
    }

    fn save_highest_certs(
        &self,
        highest_qc: &QuorumCert,
        highest_commit_qc: &QuorumCert,
        highest_timeout_cert: Option<&TimeoutCertificate>,
    ) -> Result<()> {
        let mut inner = self.writable()?;
        inner.highest_qc = Some(highest_qc.clone());
        inner.highest_commit_qc = Some(highest_commit_qc.clone());
        inner.highest_timeout_cert = highest_timeout_cert.cloned();
        Ok(())
    }

    fn save_blocks(&self, blocks: &[Block]) -> Result<()> {
        let mut inner = self.writable()?;
        for block in blocks {
            inner.blocks.insert(block.id(), block.clone());
        }
        Ok(())
    }

    fn prune_blocks(&self, ids: &[BlockId]) -> Result<()> {
        let mut inner = self.writable()?;
        for id in ids {
            inner.blocks.remove(id);
        }
        Ok(())
    }

    fn save_root(&self, root: &Block, root_qc: &QuorumCert) -> Result<()> {
        self.writable()?.root = Some((root.clone(), root_qc.clone()));
        Ok(())
    }

    fn recover(&self) -> Result<Option<RecoveryData>> {
        let inner = self.lock();
        let Some((root, root_qc)) = inner.root.clone() else {
            return Ok(None);
        };
        Ok(Some(RecoveryData {
            safety_data: inner.safety_data.clone(),
            blocks: inner
                .blocks
                .values()
                .filter(|b| b.id() != root.id())
                .cloned()
                .collect(),
            highest_qc: inner.highest_qc.clone().unwrap_or_else(|| root_qc.clone()),
            highest_commit_qc: inner
                .highest_commit_qc
                .clone()
                .unwrap_or_else(|| root_qc.clone()),
            highest_timeout_cert: inner.highest_timeout_cert.clone(),
            root,
            root_qc,
        }))
    }

    fn reset_for_epoch(
        &self,
        safety_data: &SafetyData,
        root: &Block,
        root_qc: &QuorumCert,
    ) -> Result<()> {
        let mut inner = self.writable()?;
        inner.blocks.clear();
        inner.safety_data = Some(safety_data.clone());
        inner.root = Some((root.clone(), root_qc.clone()));
        inner.highest_qc = Some(root_qc.clone());
        inner.highest_commit_qc = Some(root_qc.clone());
        inner.highest_timeout_cert = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::test_utils::TestCommittee;

    #[test]
    fn test_failed_writes_leave_state_untouched() {
        let committee = TestCommittee::new(4);
        let storage = MemoryStorage::new();
        storage.save_safety_data(&SafetyData::new(1)).unwrap();

        storage.set_fail_writes(true);
        let mut data = SafetyData::new(1);
        data.last_voted_round = 5;
        assert!(storage.save_safety_data(&data).is_err());
        assert!(storage.save_blocks(&[committee.genesis().clone()]).is_err());
        assert_eq!(storage.safety_data(), Some(SafetyData::new(1)));
        assert_eq!(storage.block_count(), 0);
    }

    #[test]
    fn test_recover_defaults_certs_to_root_qc() {
        let committee = TestCommittee::new(4);
        let storage = MemoryStorage::new();
        let genesis = committee.genesis();
        storage.save_root(genesis, genesis.quorum_cert()).unwrap();

        let recovered = storage.recover().unwrap().unwrap();
        assert_eq!(recovered.highest_qc, *genesis.quorum_cert());
        assert_eq!(recovered.highest_commit_qc, *genesis.quorum_cert());
        assert!(recovered.safety_data.is_none());
    }
}
