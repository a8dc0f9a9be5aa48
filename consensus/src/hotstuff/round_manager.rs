/// Round manager: the consensus state machine of one epoch
///
/// Every input (proposals, votes, timeout votes, sync info, retrieval
/// traffic and local timeouts) is handled here, one at a time. The round
/// manager exclusively owns the block tree, the pacemaker, this round's
/// votes and the safety rules. All outputs leave through the network
/// sender; commits go to the ledger through the block store.

use crate::config::ConsensusConfig;
use crate::hotstuff::block::Block;
use crate::hotstuff::block_store::{BlockStore, BlockStoreError, CommitSummary, Reconfiguration};
use crate::hotstuff::pending_votes::{EquivocationEvidence, PendingVotesError, VoteAddedResult};
use crate::hotstuff::proposal_generator::{ProposalError, ProposalGenerator};
use crate::hotstuff::quorum_cert::{QuorumCert, TimeoutCertificate};
use crate::hotstuff::round_state::{RoundPhase, RoundState};
use crate::hotstuff::safety_rules::{SafetyData, SafetyError, SafetyRules};
use crate::hotstuff::types::{now_usecs, Author, BlockId, BlockInfo, Epoch, Round};
use crate::hotstuff::validator::{EpochState, VerifyError};
use crate::hotstuff::vote::{Vote, VoteData};
use crate::ledger::PayloadClient;
use crate::network::{ConsensusMsg, NetworkSender, ProposalMsg, VoteMsg};
use crate::pacemaker::{
    create_proposer_election, ExponentialTimeInterval, NewRoundEvent, Pacemaker,
};
use crate::sync::{self, BlockFetcher, BlockRetrievalRequest, BlockRetrievalResponse, SyncInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Inputs parked until a missing block arrives
const MAX_DEFERRED_INPUTS: usize = 64;

/// Error classes, deciding how a failure is handled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Bad or inconsistent input: logged and dropped, nothing changes
    ProtocolViolation,
    /// Missing progress, handled by the pacemaker
    Liveness,
    /// More than f Byzantine validators, or a bug
    SafetyViolation,
    /// Signing or persistence failed: voting and proposing stop
    LocalResource,
}

#[derive(Error, Debug)]
pub enum RoundManagerError {
    #[error("Invalid message: {0}")]
    Verify(#[from] VerifyError),

    #[error("Block store: {0}")]
    BlockStore(#[from] BlockStoreError),

    #[error("Safety rules: {0}")]
    Safety(#[from] SafetyError),

    #[error("Proposal generation: {0}")]
    Proposal(#[from] ProposalError),

    #[error("Vote aggregation: {0}")]
    Votes(#[from] PendingVotesError),

    #[error("Message for round {round}, current round {current_round}")]
    StaleRound { round: Round, current_round: Round },

    #[error("{author} is not the proposer for round {round}")]
    InvalidProposer { author: Author, round: Round },

    #[error("Proposal extends QC round {qc_round} below highest QC round {highest_qc_round}")]
    StaleParent { qc_round: Round, highest_qc_round: Round },

    #[error("Second proposal {second} in round {round}, first was {first}")]
    ConflictingProposal {
        round: Round,
        first: BlockId,
        second: BlockId,
    },

    #[error("Unknown validator {0}")]
    UnknownAuthor(Author),

    #[error("Block timestamp {timestamp_usecs} is beyond the local clock bound {bound_usecs}")]
    TimestampTooFarAhead { timestamp_usecs: u64, bound_usecs: u64 },
}

impl RoundManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoundManagerError::BlockStore(e) if e.is_safety_violation() => ErrorKind::SafetyViolation,
            RoundManagerError::BlockStore(e) if e.is_local() => ErrorKind::LocalResource,
            RoundManagerError::Safety(e) if e.is_local() => ErrorKind::LocalResource,
            RoundManagerError::Proposal(ProposalError::Safety(e)) if e.is_local() => {
                ErrorKind::LocalResource
            }
            RoundManagerError::Proposal(_) => ErrorKind::Liveness,
            _ => ErrorKind::ProtocolViolation,
        }
    }
}

pub type Result<T> = std::result::Result<T, RoundManagerError>;

/// Snapshot of the engine for operators
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsensusStatus {
    pub epoch: Epoch,
    pub current_round: Round,
    pub phase: RoundPhase,
    pub highest_qc_round: Round,
    pub highest_commit_round: Round,
    pub root_round: Round,
    pub last_voted_round: Round,
    pub halted: bool,
    pub pending_evidence: usize,
    pub pending_retrievals: usize,
}

enum SyncOutcome {
    Synced,
    /// A certificate references a block being fetched
    Deferred(BlockId),
}

enum DeferredInput {
    Message(Author, ConsensusMsg),
    QuorumCert(Author, QuorumCert),
}

pub struct RoundManager {
    author: Author,
    epoch_state: EpochState,
    config: ConsensusConfig,
    block_store: BlockStore,
    pacemaker: Pacemaker,
    round_state: RoundState,
    proposal_generator: ProposalGenerator,
    safety_rules: SafetyRules,
    network: Arc<dyn NetworkSender>,
    fetcher: BlockFetcher,
    /// Fetched blocks whose ancestors are still missing
    retrieved: HashMap<BlockId, Block>,
    deferred: Vec<(BlockId, DeferredInput)>,
    evidence: Vec<EquivocationEvidence>,
    halted: bool,
    pending_reconfiguration: Option<Reconfiguration>,
}

impl RoundManager {
    pub fn new(
        epoch_state: EpochState,
        config: ConsensusConfig,
        block_store: BlockStore,
        safety_rules: SafetyRules,
        payload_client: Arc<dyn PayloadClient>,
        network: Arc<dyn NetworkSender>,
    ) -> Self {
        let election =
            create_proposer_election(&config.proposer_election, epoch_state.verifier.validator_set());
        let pacemaker = Pacemaker::new(
            ExponentialTimeInterval::from_config(&config),
            election,
            block_store.root().round(),
        );
        Self {
            author: safety_rules.author(),
            round_state: RoundState::new(0),
            proposal_generator: ProposalGenerator::new(payload_client, config.max_block_txns),
            fetcher: BlockFetcher::new(config.block_retrieval_timeout()),
            epoch_state,
            config,
            block_store,
            pacemaker,
            safety_rules,
            network,
            retrieved: HashMap::new(),
            deferred: Vec::new(),
            evidence: Vec::new(),
            halted: false,
            pending_reconfiguration: None,
        }
    }

    /// Enter the first round the stored certificates allow
    pub fn start(&mut self) -> Result<()> {
        info!(
            "{} starting epoch {} at root {}",
            self.author,
            self.epoch(),
            self.block_store.root()
        );
        let result = self.advance_round();
        self.check_error(result)
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch_state.epoch
    }

    pub fn epoch_state(&self) -> &EpochState {
        &self.epoch_state
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    pub fn current_round(&self) -> Round {
        self.pacemaker.current_round()
    }

    pub fn round_deadline(&self) -> Option<Instant> {
        self.pacemaker.round_deadline()
    }

    pub fn safety_data(&self) -> &SafetyData {
        self.safety_rules.safety_data()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Clear a halt caused by a local resource failure
    pub fn resume(&mut self) {
        if self.halted {
            info!("{} resuming voting and proposing", self.author);
            self.halted = false;
        }
    }

    /// Equivocation evidence collected so far, for an external policy
    pub fn drain_evidence(&mut self) -> Vec<EquivocationEvidence> {
        std::mem::take(&mut self.evidence)
    }

    /// A committed reconfiguration, once; the epoch is over after it
    pub fn take_reconfiguration(&mut self) -> Option<Reconfiguration> {
        self.pending_reconfiguration.take()
    }

    /// Hand the block tree over, to keep serving retrievals of this epoch
    pub fn into_block_store(self) -> BlockStore {
        self.block_store
    }

    pub fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            epoch: self.epoch(),
            current_round: self.pacemaker.current_round(),
            phase: self.round_state.phase(),
            highest_qc_round: self.block_store.highest_qc().round(),
            highest_commit_round: self.block_store.root().round(),
            root_round: self.block_store.root().round(),
            last_voted_round: self.safety_rules.safety_data().last_voted_round,
            halted: self.halted,
            pending_evidence: self.evidence.len(),
            pending_retrievals: self.fetcher.pending_count(),
        }
    }

    /// Handle one inbound message from `sender`.
    ///
    /// Errors are logged here. Local resource errors also halt the node.
    pub fn process_message(&mut self, sender: Author, msg: ConsensusMsg) -> Result<()> {
        let result = self.dispatch(sender, msg);
        self.check_error(result)
    }

    /// Handle the pacemaker deadline for `round`
    pub fn process_local_timeout(&mut self, round: Round) -> Result<()> {
        let result = self.local_timeout(round);
        self.check_error(result)
    }

    fn check_error(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::SafetyViolation => error!("{} SAFETY ALARM: {}", self.author, e),
                ErrorKind::LocalResource => {
                    if !self.halted {
                        error!("{} halting after local failure: {}", self.author, e);
                    }
                    self.halted = true;
                }
                ErrorKind::ProtocolViolation => match e {
                    RoundManagerError::StaleRound { .. } => debug!("{}: {}", self.author, e),
                    _ => warn!("{} dropping message: {}", self.author, e),
                },
                ErrorKind::Liveness => debug!("{}: {}", self.author, e),
            }
        }
        result
    }

    fn dispatch(&mut self, sender: Author, msg: ConsensusMsg) -> Result<()> {
        match msg {
            ConsensusMsg::Proposal(msg) => self.process_proposal_msg(sender, msg),
            ConsensusMsg::Vote(msg) => self.process_vote_msg(sender, msg),
            ConsensusMsg::TimeoutVote(msg) => self.process_timeout_vote_msg(sender, msg),
            ConsensusMsg::SyncInfo(info) => self.process_sync_info_msg(sender, info),
            ConsensusMsg::BlockRetrievalRequest(request) => {
                self.process_block_retrieval_request(sender, request);
                Ok(())
            }
            ConsensusMsg::BlockRetrievalResponse(response) => {
                self.process_block_retrieval_response(sender, response)
            }
            ConsensusMsg::EpochChange(msg) => self.process_sync_info_msg(sender, msg.sync_info()),
        }
    }

    fn send(&self, recipient: Author, msg: ConsensusMsg) {
        if let Err(e) = self.network.send_to(recipient, msg) {
            warn!("{} failed to send to {}: {}", self.author, recipient, e);
        }
    }

    fn broadcast(&self, msg: ConsensusMsg) {
        if let Err(e) = self.network.broadcast(msg) {
            warn!("{} broadcast failed: {}", self.author, e);
        }
    }

    fn defer(&mut self, missing: BlockId, input: DeferredInput) {
        if self.deferred.len() >= MAX_DEFERRED_INPUTS {
            self.deferred.remove(0);
        }
        self.deferred.push((missing, input));
    }

    // ---- proposals ----

    fn process_proposal_msg(&mut self, sender: Author, msg: ProposalMsg) -> Result<()> {
        self.epoch_state.ensure_epoch(msg.epoch())?;
        if let SyncOutcome::Deferred(missing) = self.sync_up(&msg.sync_info, sender)? {
            self.defer(missing, DeferredInput::Message(sender, ConsensusMsg::Proposal(msg)));
            return Ok(());
        }
        if let Some(missing) = self.process_proposal(sender, msg.proposal.clone())? {
            self.defer(missing, DeferredInput::Message(sender, ConsensusMsg::Proposal(msg)));
        }
        Ok(())
    }

    /// Validate, insert and vote for a proposal of the current round.
    /// Returns the id of a missing ancestor if the proposal had to wait.
    fn process_proposal(&mut self, sender: Author, proposal: Block) -> Result<Option<BlockId>> {
        let current_round = self.pacemaker.current_round();
        if proposal.round() != current_round {
            return Err(RoundManagerError::StaleRound {
                round: proposal.round(),
                current_round,
            });
        }
        let author = proposal
            .author()
            .ok_or_else(|| VerifyError::Malformed("proposal without author".into()))?;
        if !self.pacemaker.is_valid_proposer(author, proposal.round()) {
            return Err(RoundManagerError::InvalidProposer {
                author,
                round: proposal.round(),
            });
        }
        if let Some(first) = self.round_state.proposal() {
            if first == proposal.id() {
                // Re-delivery; vote if an earlier attempt failed locally
                self.vote_for(&proposal)?;
                return Ok(None);
            }
            return Err(RoundManagerError::ConflictingProposal {
                round: proposal.round(),
                first,
                second: proposal.id(),
            });
        }
        let highest_qc_round = self.block_store.highest_qc().round();
        if proposal.quorum_cert().round() < highest_qc_round {
            return Err(RoundManagerError::StaleParent {
                qc_round: proposal.quorum_cert().round(),
                highest_qc_round,
            });
        }
        proposal.validate_signature(&self.epoch_state)?;
        self.check_timestamp(&proposal)?;

        if !self.insert_quorum_cert(proposal.quorum_cert(), sender)? {
            return Ok(Some(proposal.quorum_cert().certified_block_id()));
        }
        self.block_store.insert_block(proposal.clone())?;
        self.round_state.record_proposal(proposal.id());
        debug!("{} accepted proposal {}", self.author, proposal);

        self.vote_for(&proposal)?;
        Ok(None)
    }

    /// Blocks may run ahead of the local clock by at most the configured skew
    fn check_timestamp(&self, proposal: &Block) -> Result<()> {
        let bound_usecs = now_usecs().saturating_add(self.config.max_clock_skew_ms.saturating_mul(1_000));
        if proposal.timestamp_usecs() > bound_usecs {
            return Err(RoundManagerError::TimestampTooFarAhead {
                timestamp_usecs: proposal.timestamp_usecs(),
                bound_usecs,
            });
        }
        Ok(())
    }

    fn vote_for(&mut self, proposal: &Block) -> Result<()> {
        if self.halted {
            warn!("{} is halted; not voting in round {}", self.author, proposal.round());
            return Ok(());
        }
        if self.round_state.vote_sent().is_some() {
            return Ok(());
        }
        let executed = self.block_store.verified_block(&proposal.id())?;
        let vote = self.safety_rules.construct_and_sign_vote(executed)?;
        let next_leader = self.pacemaker.valid_proposer(proposal.round() + 1);
        self.round_state.record_vote(vote.clone(), next_leader == self.author);
        debug!("{} voted {}", self.author, vote);

        // A vote for ourselves loops back through the inbound queue, so a
        // node holding a quorum alone cannot recurse into the next round.
        let msg = VoteMsg::new(vote, self.block_store.sync_info());
        if self.config.gossip_votes {
            self.broadcast(ConsensusMsg::Vote(msg.clone()));
            if next_leader == self.author {
                self.send(self.author, ConsensusMsg::Vote(msg));
            }
        } else {
            self.send(next_leader, ConsensusMsg::Vote(msg));
        }
        Ok(())
    }

    // ---- votes ----

    fn process_vote_msg(&mut self, sender: Author, msg: VoteMsg) -> Result<()> {
        self.epoch_state.ensure_epoch(msg.epoch())?;
        if let SyncOutcome::Deferred(missing) = self.sync_up(&msg.sync_info, sender)? {
            self.defer(missing, DeferredInput::Message(sender, ConsensusMsg::Vote(msg)));
            return Ok(());
        }
        self.process_vote(sender, &msg.vote)
    }

    fn process_timeout_vote_msg(&mut self, sender: Author, msg: VoteMsg) -> Result<()> {
        self.epoch_state.ensure_epoch(msg.epoch())?;
        if !msg.vote.is_timeout() {
            return Err(VerifyError::Malformed("timeout vote without timeout signature".into()).into());
        }
        if let SyncOutcome::Deferred(missing) = self.sync_up(&msg.sync_info, sender)? {
            self.defer(missing, DeferredInput::Message(sender, ConsensusMsg::TimeoutVote(msg)));
            return Ok(());
        }
        self.process_vote(sender, &msg.vote)
    }

    fn process_vote(&mut self, sender: Author, vote: &Vote) -> Result<()> {
        let current_round = self.pacemaker.current_round();
        if vote.round() != current_round {
            return Err(RoundManagerError::StaleRound {
                round: vote.round(),
                current_round,
            });
        }
        if !vote.is_timeout()
            && !self.config.gossip_votes
            && self.pacemaker.valid_proposer(vote.round() + 1) != self.author
        {
            debug!("{} is not the next leader; ignoring {}", self.author, vote);
            return Ok(());
        }

        match self.round_state.insert_vote(vote, &self.epoch_state.verifier)? {
            VoteAddedResult::QcReady(qc) => self.new_qc_aggregated(qc, sender),
            VoteAddedResult::TimeoutCertReady(tc) => self.new_tc_aggregated(tc),
            VoteAddedResult::InvalidAuthor(author) => Err(RoundManagerError::UnknownAuthor(author)),
            VoteAddedResult::DuplicateButDifferent(evidence) => {
                warn!(
                    "{} observed equivocation by {} in round {}",
                    self.author, evidence.author, evidence.round
                );
                self.evidence.push(*evidence);
                Ok(())
            }
            VoteAddedResult::NotEnough { voting_power } => {
                debug!("{} has voting power {} for round {}", self.author, voting_power, current_round);
                Ok(())
            }
            VoteAddedResult::DuplicateVote => Ok(()),
        }
    }

    fn new_qc_aggregated(&mut self, qc: QuorumCert, from: Author) -> Result<()> {
        info!("{} formed QC for {}", self.author, qc.certified_block());
        if !self.insert_quorum_cert(&qc, from)? {
            let missing = qc.certified_block_id();
            self.defer(missing, DeferredInput::QuorumCert(from, qc));
            return Ok(());
        }
        self.advance_round()
    }

    fn new_tc_aggregated(&mut self, tc: TimeoutCertificate) -> Result<()> {
        info!("{} formed timeout certificate for round {}", self.author, tc.round());
        self.block_store.insert_timeout_certificate(&tc)?;
        self.advance_round()
    }

    /// Insert `qc`, requesting its block from `from` when it is unknown.
    /// Returns false if the block has to be fetched first.
    fn insert_quorum_cert(&mut self, qc: &QuorumCert, from: Author) -> Result<bool> {
        match self.block_store.insert_quorum_cert(qc) {
            Ok(summary) => {
                if let Some(summary) = summary {
                    self.process_commit(summary);
                }
                Ok(true)
            }
            Err(BlockStoreError::MissingBlock(id)) => {
                self.fetch(id, qc.round(), from);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn process_commit(&mut self, summary: CommitSummary) {
        if let Some(last) = summary.committed.last() {
            self.pacemaker.update_highest_committed_round(last.round);
        }
        if let Some(reconfiguration) = summary.reconfiguration {
            info!(
                "{} committed reconfiguration in block {}; epoch {} is ending",
                self.author,
                reconfiguration.block.id(),
                self.epoch()
            );
            self.pending_reconfiguration = Some(reconfiguration);
        }
    }

    // ---- rounds ----

    fn advance_round(&mut self) -> Result<()> {
        let sync_info = self.block_store.sync_info();
        match self.pacemaker.process_certificates(&sync_info) {
            Some(event) => self.process_new_round_event(event),
            None => Ok(()),
        }
    }

    fn process_new_round_event(&mut self, event: NewRoundEvent) -> Result<()> {
        self.round_state.enter_round(event.round);
        let expired = self.fetcher.expire(|id| self.block_store.block_exists(id));
        if expired > 0 {
            debug!("{} expired {} block retrievals in round {}", self.author, expired, event.round);
        }
        if self.pacemaker.current_leader() != self.author {
            return Ok(());
        }
        if self.halted {
            warn!("{} is halted; not proposing in round {}", self.author, event.round);
            return Ok(());
        }
        if self.pending_reconfiguration.is_some() {
            return Ok(());
        }

        let proposal = self.proposal_generator.generate_proposal(
            event.round,
            self.block_store.highest_qc(),
            &self.safety_rules,
        )?;
        info!("{} proposing {}", self.author, proposal);
        let msg = ProposalMsg::new(proposal.clone(), self.block_store.sync_info());
        self.broadcast(ConsensusMsg::Proposal(msg));
        self.process_proposal(self.author, proposal)?;
        Ok(())
    }

    fn local_timeout(&mut self, round: Round) -> Result<()> {
        if self.pacemaker.process_local_timeout(round).is_none() {
            return Ok(());
        }
        if self.halted {
            warn!("{} is halted; not sending a timeout for round {}", self.author, round);
            return Ok(());
        }
        let highest_certified = self.block_store.highest_qc().certified_block().clone();
        let nil_vote = VoteData::new(BlockInfo::nil(round, &highest_certified), highest_certified);
        let vote = self.safety_rules.sign_timeout_vote(round, nil_vote)?;
        self.round_state.record_timeout(vote.clone());

        let msg = VoteMsg::new(vote.clone(), self.block_store.sync_info());
        self.broadcast(ConsensusMsg::TimeoutVote(msg));
        self.process_vote(self.author, &vote)
    }

    // ---- catch-up ----

    fn process_sync_info_msg(&mut self, sender: Author, info: SyncInfo) -> Result<()> {
        self.epoch_state.ensure_epoch(info.epoch())?;
        if let SyncOutcome::Deferred(missing) = self.sync_up(&info, sender)? {
            self.defer(missing, DeferredInput::Message(sender, ConsensusMsg::SyncInfo(info)));
        }
        Ok(())
    }

    /// Adopt any newer certificates in `sync_info`. A peer that is behind
    /// gets our own sync info back.
    fn sync_up(&mut self, sync_info: &SyncInfo, sender: Author) -> Result<SyncOutcome> {
        let local = self.block_store.sync_info();
        if !sync_info.has_newer_certificates(&local) {
            if sender != self.author && local.has_newer_certificates(sync_info) {
                debug!("{} is behind ({}); sending {}", sender, sync_info, local);
                self.send(sender, ConsensusMsg::SyncInfo(local));
            }
            return Ok(SyncOutcome::Synced);
        }
        sync_info.verify(&self.epoch_state)?;
        debug!("{} syncing up to {} from {}", self.author, sync_info, sender);

        for qc in [sync_info.highest_qc(), sync_info.highest_commit_qc()] {
            let id = qc.certified_block_id();
            if qc.round() > self.block_store.root().round() && !self.block_store.block_exists(&id) {
                self.fetch(id, qc.round(), sender);
                return Ok(SyncOutcome::Deferred(id));
            }
        }
        for qc in [sync_info.highest_commit_qc(), sync_info.highest_qc()] {
            if qc.round() > self.block_store.root().round() {
                self.insert_quorum_cert(qc, sender)?;
            }
        }
        if let Some(tc) = sync_info.highest_timeout_cert() {
            self.block_store.insert_timeout_certificate(tc)?;
        }
        self.advance_round()?;
        Ok(SyncOutcome::Synced)
    }

    fn fetch(&mut self, block_id: BlockId, round: Round, peer: Author) {
        if peer == self.author {
            return;
        }
        let num_blocks = round
            .saturating_sub(self.block_store.root().round())
            .clamp(1, self.config.max_blocks_per_retrieval);
        if let Some(request) = self.fetcher.request(block_id, num_blocks, peer) {
            debug!("{} fetching {} blocks from {} at {}", self.author, num_blocks, block_id, peer);
            self.send(peer, ConsensusMsg::BlockRetrievalRequest(request));
        }
    }

    fn process_block_retrieval_request(&self, sender: Author, request: BlockRetrievalRequest) {
        let response =
            sync::process_block_retrieval(&self.block_store, &request, self.config.max_blocks_per_retrieval);
        self.send(sender, ConsensusMsg::BlockRetrievalResponse(response));
    }

    fn process_block_retrieval_response(
        &mut self,
        sender: Author,
        response: BlockRetrievalResponse,
    ) -> Result<()> {
        let Some(first) = response.blocks.first() else {
            for id in self.fetcher.abandon_peer(sender) {
                warn!("{} could not serve block {}", sender, id);
                self.deferred.retain(|(missing, _)| *missing != id);
            }
            return Ok(());
        };
        let Some(pending) = self.fetcher.complete(&first.id()) else {
            debug!("{} ignoring unsolicited blocks from {}", self.author, sender);
            return Ok(());
        };
        response.verify(&pending.request, &self.epoch_state)?;

        let capacity = 10 * self.config.max_blocks_per_retrieval as usize;
        for block in response.blocks {
            if self.retrieved.len() >= capacity {
                break;
            }
            self.retrieved.insert(block.id(), block);
        }
        self.connect_retrieved(sender)?;
        self.retry_deferred()
    }

    /// Insert fetched blocks oldest first, each after its parent QC
    fn connect_retrieved(&mut self, peer: Author) -> Result<()> {
        loop {
            let mut ready: Vec<Block> = self
                .retrieved
                .values()
                .filter(|b| self.block_store.block_exists(&b.parent_id()))
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort_by_key(|b| b.round());
            for block in ready {
                self.retrieved.remove(&block.id());
                if self.block_store.block_exists(&block.id()) {
                    continue;
                }
                self.insert_quorum_cert(block.quorum_cert(), peer)?;
                match self.block_store.insert_block(block) {
                    Ok(_) | Err(BlockStoreError::TooOld { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let root_round = self.block_store.root().round();
        self.retrieved.retain(|_, b| b.round() > root_round);
        let next = self
            .retrieved
            .values()
            .min_by_key(|b| b.round())
            .map(|b| (b.parent_id(), b.quorum_cert().round()));
        match next {
            Some((parent, parent_round)) if parent_round > root_round => {
                self.fetch(parent, parent_round, peer);
            }
            Some(_) => {
                warn!("{} dropping fetched blocks that do not extend the root", self.author);
                self.retrieved.clear();
            }
            None => {}
        }
        Ok(())
    }

    fn retry_deferred(&mut self) -> Result<()> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|(missing, _)| self.block_store.block_exists(missing));
        self.deferred = waiting;

        for (_, input) in ready {
            let result = match input {
                DeferredInput::Message(sender, msg) => self.dispatch(sender, msg),
                DeferredInput::QuorumCert(from, qc) => self.new_qc_aggregated(qc, from),
            };
            if let Err(e) = self.check_error(result) {
                if e.kind() == ErrorKind::SafetyViolation {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
