/// Per-round bookkeeping, reset whenever the pacemaker enters a new round

use crate::hotstuff::pending_votes::{PendingVotes, PendingVotesError, VoteAddedResult};
use crate::hotstuff::types::{BlockId, Round};
use crate::hotstuff::validator::ValidatorVerifier;
use crate::hotstuff::vote::Vote;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RoundPhase {
    WaitingForProposal,
    /// Voted for this round's proposal
    Voted,
    /// Voted, and this node leads the next round, so it collects the votes
    WaitingForQc,
    /// The local timeout fired and a timeout vote went out
    TimedOut,
}

pub struct RoundState {
    round: Round,
    phase: RoundPhase,
    pending_votes: PendingVotes,
    proposal: Option<BlockId>,
    vote_sent: Option<Vote>,
}

impl RoundState {
    pub fn new(round: Round) -> Self {
        Self {
            round,
            phase: RoundPhase::WaitingForProposal,
            pending_votes: PendingVotes::new(),
            proposal: None,
            vote_sent: None,
        }
    }

    /// Forget everything about the previous round
    pub fn enter_round(&mut self, round: Round) {
        *self = Self::new(round);
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn proposal(&self) -> Option<BlockId> {
        self.proposal
    }

    pub fn vote_sent(&self) -> Option<&Vote> {
        self.vote_sent.as_ref()
    }

    pub fn pending_votes(&self) -> &PendingVotes {
        &self.pending_votes
    }

    /// Remember the first valid proposal of the round
    pub fn record_proposal(&mut self, id: BlockId) -> bool {
        if self.proposal.is_some() {
            return false;
        }
        self.proposal = Some(id);
        true
    }

    pub fn record_vote(&mut self, vote: Vote, next_leader: bool) {
        self.vote_sent = Some(vote);
        if self.phase != RoundPhase::TimedOut {
            self.phase = if next_leader {
                RoundPhase::WaitingForQc
            } else {
                RoundPhase::Voted
            };
        }
    }

    pub fn record_timeout(&mut self, vote: Vote) {
        self.vote_sent = Some(vote);
        self.phase = RoundPhase::TimedOut;
    }

    pub fn insert_vote(
        &mut self,
        vote: &Vote,
        verifier: &ValidatorVerifier,
    ) -> Result<VoteAddedResult, PendingVotesError> {
        self.pending_votes.add_vote(vote, verifier)
    }
}
