/// A block together with the result of executing it

use crate::crypto::Hash;
use crate::hotstuff::block::Block;
use crate::hotstuff::quorum_cert::QuorumCert;
use crate::hotstuff::types::{BlockId, BlockInfo, Epoch, Round};
use crate::hotstuff::vote::VoteData;
use crate::ledger::StateComputeResult;
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct ExecutedBlock {
    block: Block,
    state_compute_result: StateComputeResult,
}

impl ExecutedBlock {
    pub fn new(block: Block, state_compute_result: StateComputeResult) -> Self {
        Self {
            block,
            state_compute_result,
        }
    }

    /// A tree root is not re-executed: its state is the one its
    /// certificate already agreed on.
    pub fn from_certified_root(block: Block, root_qc: &QuorumCert) -> Self {
        let state = root_qc.certified_block().executed_state_id;
        Self::new(block, StateComputeResult::new(state, state))
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn into_block(self) -> Block {
        self.block
    }

    pub fn state_compute_result(&self) -> &StateComputeResult {
        &self.state_compute_result
    }

    pub fn executed_state_id(&self) -> Hash {
        self.state_compute_result.executed_state_id
    }

    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn epoch(&self) -> Epoch {
        self.block.epoch()
    }

    pub fn round(&self) -> Round {
        self.block.round()
    }

    pub fn parent_id(&self) -> BlockId {
        self.block.parent_id()
    }

    pub fn quorum_cert(&self) -> &QuorumCert {
        self.block.quorum_cert()
    }

    pub fn is_genesis(&self) -> bool {
        self.block.is_genesis()
    }

    pub fn block_info(&self) -> BlockInfo {
        self.block.gen_block_info(self.executed_state_id())
    }

    /// The data a validator signs when voting for this block
    pub fn vote_data(&self) -> VoteData {
        VoteData::new(self.block_info(), self.block.quorum_cert().certified_block().clone())
    }
}

impl fmt::Debug for ExecutedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ExecutedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} state {}", self.block, self.executed_state_id())
    }
}
