// Chained HotStuff consensus core
// Protocol types, the block tree with its commit rule, vote aggregation,
// safety rules, and the per-epoch round manager driving them

pub mod block;
pub mod block_store;
pub mod engine;
pub mod epoch_manager;
pub mod executed_block;
pub mod pending_votes;
pub mod proposal_generator;
pub mod quorum_cert;
pub mod round_manager;
pub mod round_state;
pub mod safety_rules;
pub mod types;
pub mod validator;
pub mod vote;

#[cfg(test)]
pub mod test_utils;


pub use block::Block;
pub use block_store::{BlockStore, BlockStoreError, CommitSummary};
pub use executed_block::ExecutedBlock;
pub use pending_votes::{EquivocationEvidence, PendingVotes, VoteAddedResult};
pub use quorum_cert::{QuorumCert, TimeoutCertificate};
pub use types::{Author, BlockId, BlockInfo, Epoch, Payload, Round};
pub use validator::{EpochState, ValidatorSet, ValidatorVerifier};
pub use vote::{Timeout, Vote, VoteData};
