/// Block tree with the three-chain commit rule
/// 
/// Blocks live in an arena keyed by id, each next to the result of
/// executing it; parent links are the ids certified by each block's parent
/// QC. The root is the last committed block, and everything in the arena
/// descends from it.

use crate::hotstuff::block::Block;
use crate::hotstuff::executed_block::ExecutedBlock;
use crate::hotstuff::quorum_cert::{QuorumCert, TimeoutCertificate};
use crate::hotstuff::types::{BlockId, BlockInfo, Epoch, Round};
use crate::hotstuff::validator::{ValidatorSet, VerifyError};
use crate::ledger::{LedgerError, StateComputer};
use crate::storage::{PersistentLivenessStorage, RecoveryData, StorageError};
use crate::sync::SyncInfo;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Committed blocks kept around after pruning so lagging peers can fetch them
const PRUNED_BLOCKS_IN_MEM: usize = 256;

#[derive(Error, Debug)]
pub enum BlockStoreError {
    #[error("Parent block {0} not found")]
    MissingParent(BlockId),

    #[error("Certified block {0} not found")]
    MissingBlock(BlockId),

    #[error("Block round {round} is not above root round {root_round}")]
    TooOld { round: Round, root_round: Round },

    #[error("Epoch mismatch: expected {expected}, got {got}")]
    EpochMismatch { expected: Epoch, got: Epoch },

    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] VerifyError),

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Certified state of block {0} differs from local execution")]
    StateDivergence(BlockId),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BlockStoreError {
    /// Evidence of more than f Byzantine validators, or a bug
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            BlockStoreError::SafetyViolation(_) | BlockStoreError::StateDivergence(_)
        )
    }

    /// Local failures that stop this node from participating
    pub fn is_local(&self) -> bool {
        matches!(self, BlockStoreError::Ledger(_) | BlockStoreError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, BlockStoreError>;

/// A committed block that changed the validator set
#[derive(Clone, Debug)]
pub struct Reconfiguration {
    pub block: Block,
    /// The certificate whose insertion committed `block`
    pub commit_qc: QuorumCert,
    pub validators: ValidatorSet,
}

/// What one commit-rule firing did
#[derive(Clone, Debug, Default)]
pub struct CommitSummary {
    /// Newly committed blocks, in round order
    pub committed: Vec<BlockInfo>,
    pub reconfiguration: Option<Reconfiguration>,
}

pub struct BlockStore {
    epoch: Epoch,
    blocks: HashMap<BlockId, ExecutedBlock>,
    children: HashMap<BlockId, Vec<BlockId>>,
    /// QC certifying each block, where one is known
    certs: HashMap<BlockId, QuorumCert>,
    /// Certified block per round above the root, to catch conflicting QCs
    certified_rounds: BTreeMap<Round, BlockId>,
    root_id: BlockId,
    highest_qc: QuorumCert,
    highest_commit_qc: QuorumCert,
    highest_timeout_cert: Option<TimeoutCertificate>,
    /// Set once a reconfiguration block commits; the epoch is over
    reconfigured: bool,
    pruned: HashMap<BlockId, Block>,
    pruned_order: VecDeque<BlockId>,
    state_computer: Arc<dyn StateComputer>,
    storage: Arc<dyn PersistentLivenessStorage>,
}

impl BlockStore {
    /// Start a tree at `root`, certified by `root_qc`.
    pub fn new(
        root: Block,
        root_qc: QuorumCert,
        state_computer: Arc<dyn StateComputer>,
        storage: Arc<dyn PersistentLivenessStorage>,
    ) -> Self {
        let root_id = root.id();
        let epoch = root.epoch();
        let mut certs = HashMap::new();
        certs.insert(root_id, root_qc.clone());
        let mut blocks = HashMap::new();
        blocks.insert(root_id, ExecutedBlock::from_certified_root(root, &root_qc));

        Self {
            epoch,
            blocks,
            children: HashMap::new(),
            certs,
            certified_rounds: BTreeMap::new(),
            root_id,
            highest_qc: root_qc.clone(),
            highest_commit_qc: root_qc,
            highest_timeout_cert: None,
            reconfigured: false,
            pruned: HashMap::new(),
            pruned_order: VecDeque::new(),
            state_computer,
            storage,
        }
    }

    /// Rebuild from persisted data. Blocks that no longer attach to the
    /// root are dropped; certificates whose blocks are gone fall back to
    /// the root QC.
    pub fn recover(
        data: RecoveryData,
        state_computer: Arc<dyn StateComputer>,
        storage: Arc<dyn PersistentLivenessStorage>,
    ) -> Self {
        let mut store = Self::new(data.root, data.root_qc, state_computer, storage);
        let mut blocks = data.blocks;
        blocks.sort_by_key(|b| b.round());
        for block in blocks {
            if let Err(e) = store.insert_recovered(block) {
                warn!("Dropping unrecoverable block: {}", e);
            }
        }
        if store.block_exists(&data.highest_commit_qc.certified_block_id()) {
            store.record_qc(data.highest_commit_qc.clone());
            store.highest_commit_qc = data.highest_commit_qc;
        }
        if store.block_exists(&data.highest_qc.certified_block_id())
            && data.highest_qc.round() > store.highest_qc.round()
        {
            store.record_qc(data.highest_qc.clone());
            store.highest_qc = data.highest_qc;
        }
        if let Some(tc) = data.highest_timeout_cert {
            if tc.epoch() == store.epoch {
                store.highest_timeout_cert = Some(tc);
            }
        }
        info!(
            "Recovered block store: root round {}, {} blocks, highest QC round {}",
            store.root().round(),
            store.blocks.len(),
            store.highest_qc.round()
        );
        store
    }

    fn insert_recovered(&mut self, block: Block) -> Result<()> {
        self.validate_insert(&block)?;
        let executed = self.execute(block)?;
        self.record_qc(executed.quorum_cert().clone());
        self.attach(executed);
        Ok(())
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn root(&self) -> &ExecutedBlock {
        // The root is never pruned
        &self.blocks[&self.root_id]
    }

    pub fn get_block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id).map(ExecutedBlock::block)
    }

    pub fn get_executed_block(&self, id: &BlockId) -> Option<&ExecutedBlock> {
        self.blocks.get(id)
    }

    /// The executed block `id`, once the ledger confirms its execution
    /// result. Voting goes through here.
    pub fn verified_block(&self, id: &BlockId) -> Result<&ExecutedBlock> {
        let executed = self.blocks.get(id).ok_or(BlockStoreError::MissingBlock(*id))?;
        self.state_computer
            .verify(executed.block(), executed.state_compute_result())?;
        Ok(executed)
    }

    pub fn block_exists(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn highest_qc(&self) -> &QuorumCert {
        &self.highest_qc
    }

    pub fn highest_commit_qc(&self) -> &QuorumCert {
        &self.highest_commit_qc
    }

    pub fn highest_timeout_cert(&self) -> Option<&TimeoutCertificate> {
        self.highest_timeout_cert.as_ref()
    }

    pub fn quorum_cert_for_block(&self, id: &BlockId) -> Option<&QuorumCert> {
        self.certs.get(id)
    }

    pub fn sync_info(&self) -> SyncInfo {
        SyncInfo::new(
            self.highest_qc.clone(),
            self.highest_commit_qc.clone(),
            self.highest_timeout_cert.clone(),
        )
    }

    fn validate_insert(&self, block: &Block) -> Result<()> {
        if block.epoch() != self.epoch {
            return Err(BlockStoreError::EpochMismatch {
                expected: self.epoch,
                got: block.epoch(),
            });
        }
        let root_round = self.root().round();
        if block.round() <= root_round {
            return Err(BlockStoreError::TooOld {
                round: block.round(),
                root_round,
            });
        }
        block.verify_well_formed()?;
        let parent = self
            .blocks
            .get(&block.parent_id())
            .ok_or(BlockStoreError::MissingParent(block.parent_id()))?;
        if parent.block_info() != *block.quorum_cert().certified_block() {
            return Err(BlockStoreError::StateDivergence(parent.id()));
        }
        Ok(())
    }

    /// Run `block` on top of its parent's executed state
    fn execute(&self, block: Block) -> Result<ExecutedBlock> {
        let parent_state = self
            .blocks
            .get(&block.parent_id())
            .map(ExecutedBlock::executed_state_id)
            .ok_or(BlockStoreError::MissingParent(block.parent_id()))?;
        let result = self.state_computer.compute(&block, parent_state)?;
        Ok(ExecutedBlock::new(block, result))
    }

    fn attach(&mut self, block: ExecutedBlock) {
        let id = block.id();
        self.children.entry(block.parent_id()).or_default().push(id);
        self.blocks.insert(id, block);
    }

    /// Execute and insert a block whose parent is already in the tree.
    ///
    /// Inserting a known block is a no-op. Nothing is mutated on error.
    pub fn insert_block(&mut self, block: Block) -> Result<&ExecutedBlock> {
        let id = block.id();
        if self.blocks.contains_key(&id) {
            return Ok(&self.blocks[&id]);
        }
        self.validate_insert(&block)?;
        let executed = self.execute(block)?;
        self.storage.save_blocks(std::slice::from_ref(executed.block()))?;
        self.certs
            .entry(executed.parent_id())
            .or_insert_with(|| executed.quorum_cert().clone());
        debug!("Inserted block {}", executed);
        self.attach(executed);
        Ok(&self.blocks[&id])
    }

    fn record_qc(&mut self, qc: QuorumCert) {
        let id = qc.certified_block_id();
        if qc.round() > self.root().round() {
            self.certified_rounds.entry(qc.round()).or_insert(id);
        }
        self.certs.entry(id).or_insert(qc);
    }

    /// Add a QC for a block in the tree, raise the highest QC, and run the
    /// commit rule. Returns what was committed, if anything.
    pub fn insert_quorum_cert(&mut self, qc: &QuorumCert) -> Result<Option<CommitSummary>> {
        if qc.epoch() != self.epoch {
            return Err(BlockStoreError::EpochMismatch {
                expected: self.epoch,
                got: qc.epoch(),
            });
        }
        let id = qc.certified_block_id();
        let block = self
            .blocks
            .get(&id)
            .ok_or(BlockStoreError::MissingBlock(id))?;
        if block.block_info() != *qc.certified_block() {
            error!(
                "QC certifies {} but local execution gives {}",
                qc.certified_block().executed_state_id,
                block.executed_state_id()
            );
            return Err(BlockStoreError::StateDivergence(id));
        }
        if qc.round() > self.root().round() {
            if let Some(other) = self.certified_rounds.get(&qc.round()) {
                if *other != id {
                    error!(
                        "Conflicting QCs for round {}: {} and {}",
                        qc.round(),
                        other,
                        id
                    );
                    return Err(BlockStoreError::SafetyViolation(format!(
                        "two QCs certify different blocks in round {}",
                        qc.round()
                    )));
                }
            }
        }
        self.record_qc(qc.clone());

        let mut certs_changed = false;
        if qc.round() > self.highest_qc.round() {
            self.highest_qc = qc.clone();
            certs_changed = true;
        }

        let commit_target = self.commit_target(qc);
        if commit_target.is_some() && qc.round() > self.highest_commit_qc.round() {
            self.highest_commit_qc = qc.clone();
            certs_changed = true;
        }
        if certs_changed {
            self.storage.save_highest_certs(
                &self.highest_qc,
                &self.highest_commit_qc,
                self.highest_timeout_cert.as_ref(),
            )?;
        }

        match commit_target {
            Some(target) => Ok(Some(self.commit(target, qc)?)),
            None => Ok(None),
        }
    }

    /// The block the three-chain rule commits when `qc` arrives, if any:
    /// `qc` certifies B3, B3's parent QC certifies B2, B2's parent QC
    /// certifies B1, with B1, B2, B3 in consecutive rounds.
    fn commit_target(&self, qc: &QuorumCert) -> Option<BlockId> {
        if self.reconfigured {
            return None;
        }
        let b3 = self.blocks.get(&qc.certified_block_id())?;
        let b2 = self.blocks.get(&b3.parent_id())?;
        let b1 = self.blocks.get(&b2.parent_id())?;
        if b3.id() == b2.id() || b2.id() == b1.id() {
            return None;
        }
        let consecutive = b3.round() == b2.round() + 1 && b2.round() == b1.round() + 1;
        if consecutive && b1.round() > self.root().round() {
            Some(b1.id())
        } else {
            None
        }
    }

    /// Blocks strictly above the root up to and including `id`, oldest
    /// first. `None` if `id` does not lead back to the root.
    pub fn path_from_root(&self, id: &BlockId) -> Option<Vec<&ExecutedBlock>> {
        let root_round = self.root().round();
        let mut path = Vec::new();
        let mut current = self.blocks.get(id)?;
        while current.round() > root_round {
            path.push(current);
            current = self.blocks.get(&current.parent_id())?;
        }
        if current.id() != self.root_id {
            return None;
        }
        path.reverse();
        Some(path)
    }

    fn commit(&mut self, target: BlockId, commit_qc: &QuorumCert) -> Result<CommitSummary> {
        let path: Vec<ExecutedBlock> = match self.path_from_root(&target) {
            Some(path) => path.into_iter().cloned().collect(),
            None => {
                error!("Block {} does not extend the committed root", target);
                return Err(BlockStoreError::SafetyViolation(format!(
                    "commit of {} does not extend root {}",
                    target, self.root_id
                )));
            }
        };

        let mut summary = CommitSummary::default();
        let delivered = self.deliver(path, commit_qc, &mut summary);
        self.prune();
        delivered.map(|()| summary)
    }

    /// Hand `path` to the ledger oldest first. The root follows each
    /// delivered block, so a retry after a failure resumes behind the last
    /// block the ledger accepted.
    fn deliver(
        &mut self,
        path: Vec<ExecutedBlock>,
        commit_qc: &QuorumCert,
        summary: &mut CommitSummary,
    ) -> Result<()> {
        for block in path {
            let result = self.state_computer.commit(&block)?;
            info!("Committed block {}", block);
            summary.committed.push(block.block_info());
            let id = block.id();
            if let Some(validators) = result.reconfiguration {
                info!(
                    "Block {} ends epoch {}; stopping commits in this epoch",
                    id, self.epoch
                );
                self.reconfigured = true;
                summary.reconfiguration = Some(Reconfiguration {
                    block: block.into_block(),
                    commit_qc: commit_qc.clone(),
                    validators,
                });
                return self.set_root(id);
            }
            self.set_root(id)?;
        }
        Ok(())
    }

    fn set_root(&mut self, new_root: BlockId) -> Result<()> {
        self.root_id = new_root;
        if let (Some(root), Some(root_qc)) = (self.blocks.get(&new_root), self.certs.get(&new_root)) {
            self.storage.save_root(root.block(), root_qc)?;
        }
        Ok(())
    }

    /// Drop every block that does not descend from the root
    fn prune(&mut self) {
        let mut keep = HashSet::new();
        let mut queue = VecDeque::from([self.root_id]);
        while let Some(id) = queue.pop_front() {
            if keep.insert(id) {
                if let Some(children) = self.children.get(&id) {
                    queue.extend(children.iter().copied());
                }
            }
        }

        let removed: Vec<BlockId> = self
            .blocks
            .keys()
            .filter(|id| !keep.contains(*id))
            .copied()
            .collect();
        for id in &removed {
            if let Some(block) = self.blocks.remove(id) {
                self.cache_pruned(block.into_block());
            }
            self.children.remove(id);
            self.certs.remove(id);
        }
        let root_round = self.root().round();
        self.certified_rounds = self.certified_rounds.split_off(&(root_round + 1));

        if !removed.is_empty() {
            debug!("Pruned {} blocks below root {}", removed.len(), self.root_id);
            if let Err(e) = self.storage.prune_blocks(&removed) {
                // Stale blocks on disk are dropped again at recovery
                warn!("Failed to prune blocks from storage: {}", e);
            }
        }
    }

    fn cache_pruned(&mut self, block: Block) {
        self.pruned_order.push_back(block.id());
        self.pruned.insert(block.id(), block);
        while self.pruned_order.len() > PRUNED_BLOCKS_IN_MEM {
            if let Some(old) = self.pruned_order.pop_front() {
                self.pruned.remove(&old);
            }
        }
    }

    /// Look a block up in the tree or among recently pruned blocks
    pub fn get_block_for_retrieval(&self, id: &BlockId) -> Option<&Block> {
        self.blocks
            .get(id)
            .map(ExecutedBlock::block)
            .or_else(|| self.pruned.get(id))
    }

    /// Record a timeout certificate if it is the highest seen
    pub fn insert_timeout_certificate(&mut self, tc: &TimeoutCertificate) -> Result<()> {
        if tc.epoch() != self.epoch {
            return Err(BlockStoreError::EpochMismatch {
                expected: self.epoch,
                got: tc.epoch(),
            });
        }
        let current = self.highest_timeout_cert.as_ref().map_or(0, |t| t.round());
        if tc.round() <= current {
            return Ok(());
        }
        self.highest_timeout_cert = Some(tc.clone());
        self.storage.save_highest_certs(
            &self.highest_qc,
            &self.highest_commit_qc,
            self.highest_timeout_cert.as_ref(),
        )?;
        Ok(())
    }
}
