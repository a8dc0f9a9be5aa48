/// Ledger / application interface for consensus
/// 
/// The engine executes blocks through a `StateComputer` as they enter the
/// tree, hands it committed blocks, and pulls transaction payloads from a
/// `PayloadClient`. Execution semantics and durable block storage live
/// behind these traits.

use crate::crypto::{CryptoHasher, Hash};
use crate::hotstuff::block::Block;
use crate::hotstuff::executed_block::ExecutedBlock;
use crate::hotstuff::types::{BlockId, BlockInfo, Epoch, Payload, Round};
use crate::hotstuff::validator::ValidatorSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Ledger errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Execution result for block {0} does not match the ledger")]
    StateMismatch(BlockId),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Block {0} committed twice")]
    AlreadyCommitted(BlockId),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Outcome of executing a block on top of its parent's state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateComputeResult {
    pub parent_state_id: Hash,
    pub executed_state_id: Hash,
}

impl StateComputeResult {
    pub fn new(parent_state_id: Hash, executed_state_id: Hash) -> Self {
        Self {
            parent_state_id,
            executed_state_id,
        }
    }
}

/// What the ledger reports back for a committed block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitResult {
    /// Set when the block carried a validator-set change; the new set
    /// takes over from the next epoch.
    pub reconfiguration: Option<ValidatorSet>,
}

pub trait StateComputer: Send + Sync {
    /// Execute `block` speculatively on top of `parent_state_id`. Must be
    /// deterministic, since votes sign the resulting state id.
    fn compute(&self, block: &Block, parent_state_id: Hash) -> Result<StateComputeResult>;

    /// Check an execution result before this node votes for it
    fn verify(&self, block: &Block, result: &StateComputeResult) -> Result<()>;

    /// Receives committed blocks, exactly once each, in round order
    fn commit(&self, block: &ExecutedBlock) -> Result<CommitResult>;
}

/// Source of transactions for new proposals
pub trait PayloadClient: Send + Sync {
    /// Must not block; returns an empty payload when nothing is ready.
    fn pull_payload(&self, max_txns: usize) -> Payload;
}

#[derive(Default)]
struct LedgerInner {
    committed: Vec<BlockInfo>,
    committed_ids: HashSet<BlockId>,
    committed_txns: Vec<Vec<u8>>,
    mempool: VecDeque<Vec<u8>>,
    /// (epoch, first round at or after which the change applies, new set)
    scheduled_reconfiguration: Option<(Epoch, Round, ValidatorSet)>,
    fail_commits: bool,
    fail_executions: bool,
}

/// In-memory ledger used for simulation and tests.
///
/// Its state id is a running digest of every transaction applied so far.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// State id after applying `payload` to `parent_state_id`
    pub fn apply_payload(parent_state_id: Hash, payload: &Payload) -> Hash {
        let mut hasher = CryptoHasher::new("InMemoryLedgerState");
        hasher
            .update(parent_state_id.as_bytes())
            .update_u64(payload.len() as u64);
        for txn in payload {
            hasher.update_bytes(txn);
        }
        hasher.finish()
    }

    /// Queue a transaction for inclusion in a future proposal
    pub fn submit(&self, txn: Vec<u8>) {
        self.lock().mempool.push_back(txn);
    }

    /// Committed blocks, in commit order
    pub fn committed_blocks(&self) -> Vec<BlockInfo> {
        self.lock().committed.clone()
    }

    pub fn committed_transactions(&self) -> Vec<Vec<u8>> {
        self.lock().committed_txns.clone()
    }

    /// Report `set` as a reconfiguration on the first commit in `epoch`
    /// whose round is at least `round`.
    pub fn schedule_reconfiguration(&self, epoch: Epoch, round: Round, set: ValidatorSet) {
        self.lock().scheduled_reconfiguration = Some((epoch, round, set));
    }

    /// Make every subsequent commit fail (simulates a storage outage)
    pub fn set_fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    /// Make every subsequent execution fail
    pub fn set_fail_executions(&self, fail: bool) {
        self.lock().fail_executions = fail;
    }
}

impl StateComputer for InMemoryLedger {
    fn compute(&self, block: &Block, parent_state_id: Hash) -> Result<StateComputeResult> {
        if self.lock().fail_executions {
            return Err(LedgerError::ExecutionFailed("executor unavailable".into()));
        }
        let executed = Self::apply_payload(parent_state_id, block.payload());
        Ok(StateComputeResult::new(parent_state_id, executed))
    }

    fn verify(&self, block: &Block, result: &StateComputeResult) -> Result<()> {
        if Self::apply_payload(result.parent_state_id, block.payload()) != result.executed_state_id {
            return Err(LedgerError::StateMismatch(block.id()));
        }
        Ok(())
    }

    fn commit(&self, block: &ExecutedBlock) -> Result<CommitResult> {
        let mut inner = self.lock();
        if inner.fail_commits {
            return Err(LedgerError::CommitFailed("ledger unavailable".into()));
        }
        if !inner.committed_ids.insert(block.id()) {
            return Err(LedgerError::AlreadyCommitted(block.id()));
        }
        inner.committed.push(block.block_info());
        inner.committed_txns.extend(block.block().payload().iter().cloned());

        let triggers = matches!(
            &inner.scheduled_reconfiguration,
            Some((epoch, round, _)) if *epoch == block.epoch() && block.round() >= *round
        );
        let reconfiguration = if triggers {
            inner.scheduled_reconfiguration.take().map(|(_, _, set)| set)
        } else {
            None
        };
        Ok(CommitResult { reconfiguration })
    }
}

impl PayloadClient for InMemoryLedger {
    fn pull_payload(&self, max_txns: usize) -> Payload {
        let mut inner = self.lock();
        let take = max_txns.min(inner.mempool.len());
        inner.mempool.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::test_utils::TestCommittee;
    use crate::hotstuff::types::PRE_GENESIS_STATE_ID;

    #[test]
    fn test_commit_records_block_once() {
        let committee = TestCommittee::new(4);
        let ledger = InMemoryLedger::new();
        let block = committee.execute(&committee.make_block(1, 1, committee.genesis().quorum_cert()));

        assert_eq!(ledger.commit(&block).unwrap(), CommitResult::default());
        assert_eq!(ledger.commit(&block), Err(LedgerError::AlreadyCommitted(block.id())));
        assert_eq!(ledger.committed_blocks(), vec![block.block_info()]);
        assert_eq!(ledger.committed_transactions(), block.block().payload().clone());
    }

    #[test]
    fn test_compute_is_deterministic_and_chains() {
        let committee = TestCommittee::new(4);
        let ledger = InMemoryLedger::new();
        let block = committee.make_block(1, 1, committee.genesis().quorum_cert());

        let first = ledger.compute(&block, PRE_GENESIS_STATE_ID).unwrap();
        assert_eq!(first, ledger.compute(&block, PRE_GENESIS_STATE_ID).unwrap());
        assert_eq!(first.parent_state_id, PRE_GENESIS_STATE_ID);
        assert_ne!(first.executed_state_id, PRE_GENESIS_STATE_ID);

        // Same block on a different parent state lands elsewhere
        let other = ledger.compute(&block, first.executed_state_id).unwrap();
        assert_ne!(other.executed_state_id, first.executed_state_id);
    }

    #[test]
    fn test_verify_rejects_foreign_result() {
        let committee = TestCommittee::new(4);
        let ledger = InMemoryLedger::new();
        let block = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let result = ledger.compute(&block, PRE_GENESIS_STATE_ID).unwrap();
        assert_eq!(ledger.verify(&block, &result), Ok(()));

        let forged = StateComputeResult::new(PRE_GENESIS_STATE_ID, PRE_GENESIS_STATE_ID);
        assert_eq!(ledger.verify(&block, &forged), Err(LedgerError::StateMismatch(block.id())));
    }

    #[test]
    fn test_pull_payload_never_blocks() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.pull_payload(10).is_empty());

        for i in 0..5u8 {
            ledger.submit(vec![i]);
        }
        assert_eq!(ledger.pull_payload(3), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(ledger.pull_payload(10), vec![vec![3], vec![4]]);
    }

    #[test]
    fn test_scheduled_reconfiguration_fires_once() {
        let committee = TestCommittee::new(4);
        let ledger = InMemoryLedger::new();
        let (blocks, _) = committee.certified_chain(3);
        ledger.schedule_reconfiguration(1, 2, committee.validator_set());

        let executed: Vec<_> = blocks.iter().map(|b| committee.execute(b)).collect();
        assert!(ledger.commit(&executed[0]).unwrap().reconfiguration.is_none());
        assert_eq!(
            ledger.commit(&executed[1]).unwrap().reconfiguration,
            Some(committee.validator_set())
        );
        assert!(ledger.commit(&executed[2]).unwrap().reconfiguration.is_none());
    }

    #[test]
    fn test_failing_commits_and_executions() {
        let committee = TestCommittee::new(4);
        let ledger = InMemoryLedger::new();
        let block = committee.make_block(1, 1, committee.genesis().quorum_cert());

        ledger.set_fail_commits(true);
        assert!(matches!(
            ledger.commit(&committee.execute(&block)),
            Err(LedgerError::CommitFailed(_))
        ));
        assert!(ledger.committed_blocks().is_empty());

        ledger.set_fail_executions(true);
        assert!(matches!(
            ledger.compute(&block, PRE_GENESIS_STATE_ID),
            Err(LedgerError::ExecutionFailed(_))
        ));
    }
}
