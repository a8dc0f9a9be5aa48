// Consensus wire messages

use crate::hotstuff::block::Block;
use crate::hotstuff::quorum_cert::QuorumCert;
use crate::hotstuff::types::{Author, Epoch, Round};
use crate::hotstuff::vote::Vote;
use crate::sync::{BlockRetrievalRequest, BlockRetrievalResponse, SyncInfo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A proposal together with the proposer's certificates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalMsg {
    pub proposal: Block,
    pub sync_info: SyncInfo,
}

impl ProposalMsg {
    pub fn new(proposal: Block, sync_info: SyncInfo) -> Self {
        Self {
            proposal,
            sync_info,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.proposal.epoch()
    }

    pub fn round(&self) -> Round {
        self.proposal.round()
    }
}

/// A vote (regular or timeout) together with the voter's certificates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteMsg {
    pub vote: Vote,
    pub sync_info: SyncInfo,
}

impl VoteMsg {
    pub fn new(vote: Vote, sync_info: SyncInfo) -> Self {
        Self { vote, sync_info }
    }

    pub fn epoch(&self) -> Epoch {
        self.vote.epoch()
    }
}

/// Announces the end of an epoch: `commit_qc` is the certificate whose
/// insertion committed the reconfiguration block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochChangeMsg {
    pub commit_qc: QuorumCert,
}

impl EpochChangeMsg {
    pub fn new(commit_qc: QuorumCert) -> Self {
        Self { commit_qc }
    }

    /// The epoch that ended
    pub fn epoch(&self) -> Epoch {
        self.commit_qc.epoch()
    }

    /// The commit certificate as catch-up information for that epoch
    pub fn sync_info(&self) -> SyncInfo {
        SyncInfo::new(self.commit_qc.clone(), self.commit_qc.clone(), None)
    }
}

/// Everything consensus nodes send each other
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMsg {
    Proposal(ProposalMsg),
    Vote(VoteMsg),
    TimeoutVote(VoteMsg),
    SyncInfo(SyncInfo),
    BlockRetrievalRequest(BlockRetrievalRequest),
    BlockRetrievalResponse(BlockRetrievalResponse),
    EpochChange(EpochChangeMsg),
}

impl ConsensusMsg {
    /// Epoch the message belongs to; retrieval messages carry none
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            ConsensusMsg::Proposal(msg) => Some(msg.epoch()),
            ConsensusMsg::Vote(msg) | ConsensusMsg::TimeoutVote(msg) => Some(msg.epoch()),
            ConsensusMsg::SyncInfo(info) => Some(info.epoch()),
            ConsensusMsg::EpochChange(msg) => Some(msg.epoch()),
            ConsensusMsg::BlockRetrievalRequest(_) | ConsensusMsg::BlockRetrievalResponse(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsensusMsg::Proposal(_) => "Proposal",
            ConsensusMsg::Vote(_) => "Vote",
            ConsensusMsg::TimeoutVote(_) => "TimeoutVote",
            ConsensusMsg::SyncInfo(_) => "SyncInfo",
            ConsensusMsg::BlockRetrievalRequest(_) => "BlockRetrievalRequest",
            ConsensusMsg::BlockRetrievalResponse(_) => "BlockRetrievalResponse",
            ConsensusMsg::EpochChange(_) => "EpochChange",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl fmt::Display for ConsensusMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.epoch() {
            Some(epoch) => write!(f, "{}[epoch {}]", self.name(), epoch),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// A message and the validator it came from
pub type Inbound = (Author, ConsensusMsg);
