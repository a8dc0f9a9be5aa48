/// Block retrieval messages
/// 
/// A node that learns of a certificate for a block it does not have asks
/// the sender for that block and its ancestors.

use crate::hotstuff::block::Block;
use crate::hotstuff::types::BlockId;
use crate::hotstuff::validator::{EpochState, VerifyError};
use serde::{Deserialize, Serialize};

/// Ask for `num_blocks` blocks ending at `block_id`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRetrievalRequest {
    pub block_id: BlockId,
    pub num_blocks: u64,
}

impl BlockRetrievalRequest {
    pub fn new(block_id: BlockId, num_blocks: u64) -> Self {
        Self {
            block_id,
            num_blocks,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRetrievalStatus {
    /// All requested blocks are included
    Succeeded,
    /// The requested block is unknown to the server
    IdNotFound,
    /// The chain ran out before `num_blocks` were collected
    NotEnoughBlocks,
}

/// Blocks are ordered newest first: `blocks[0]` is the requested block,
/// each following block is the parent of the one before.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRetrievalResponse {
    pub status: BlockRetrievalStatus,
    pub blocks: Vec<Block>,
}

impl BlockRetrievalResponse {
    pub fn new(status: BlockRetrievalStatus, blocks: Vec<Block>) -> Self {
        Self { status, blocks }
    }

    /// Check that the response answers `request`: the chain starts at the
    /// requested id, parent links hold, and every block is signed by a
    /// validator of the epoch.
    pub fn verify(
        &self,
        request: &BlockRetrievalRequest,
        epoch_state: &EpochState,
    ) -> Result<(), VerifyError> {
        if self.status != BlockRetrievalStatus::IdNotFound && self.blocks.is_empty() {
            return Err(VerifyError::Malformed("empty retrieval response".into()));
        }
        if self.blocks.len() as u64 > request.num_blocks {
            return Err(VerifyError::Malformed(format!(
                "{} blocks returned, {} requested",
                self.blocks.len(),
                request.num_blocks
            )));
        }
        if let Some(first) = self.blocks.first() {
            if first.id() != request.block_id {
                return Err(VerifyError::Malformed("response starts at the wrong block".into()));
            }
        }
        for pair in self.blocks.windows(2) {
            if pair[0].parent_id() != pair[1].id() {
                return Err(VerifyError::Malformed("retrieved blocks are not a chain".into()));
            }
        }
        for block in &self.blocks {
            if block.is_genesis() {
                block.verify_well_formed()?;
            } else {
                block.validate_signature(epoch_state)?;
            }
        }
        Ok(())
    }
}
