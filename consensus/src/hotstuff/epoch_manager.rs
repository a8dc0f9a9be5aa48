/// Epoch manager
///
/// Owns the RoundManager of the current epoch and everything needed to
/// build the next one. Messages are routed by epoch. When a committed
/// block changes the validator set, the old RoundManager is retired and a
/// fresh one starts from a genesis anchored at that block.

use crate::config::ConsensusConfig;
use crate::crypto::ValidatorSigner;
use crate::hotstuff::block::Block;
use crate::hotstuff::block_store::BlockStore;
use crate::hotstuff::round_manager::{
    ConsensusStatus, ErrorKind, Result as RoundResult, RoundManager,
};
use crate::hotstuff::safety_rules::{SafetyData, SafetyRules};
use crate::hotstuff::types::{Author, Epoch, Round};
use crate::hotstuff::validator::{EpochState, ValidatorSet, ValidatorSetProvider};
use crate::ledger::{PayloadClient, StateComputer};
use crate::network::{ConsensusMsg, EpochChangeMsg, NetworkSender};
use crate::storage::PersistentLivenessStorage;
use crate::sync::{self, BlockRetrievalRequest, BlockRetrievalStatus};
use anyhow::{anyhow, bail, Context};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Epoch of a validator that has never reconfigured
pub const GENESIS_EPOCH: Epoch = 1;

pub struct EpochManager {
    author: Author,
    config: ConsensusConfig,
    signer: Arc<dyn ValidatorSigner>,
    storage: Arc<dyn PersistentLivenessStorage>,
    state_computer: Arc<dyn StateComputer>,
    payload_client: Arc<dyn PayloadClient>,
    network: Arc<dyn NetworkSender>,
    round_manager: RoundManager,
    /// Tree of the epoch before the current one, kept to serve retrievals
    previous_store: Option<BlockStore>,
    /// Proof of each finished epoch's last commit, sent to laggards
    epoch_changes: BTreeMap<Epoch, EpochChangeMsg>,
    /// Next-epoch traffic that arrived before this node reconfigured
    future_messages: VecDeque<(Author, ConsensusMsg)>,
}

impl EpochManager {
    /// Build the epoch manager from persisted state, or from the genesis
    /// of `GENESIS_EPOCH` when storage is empty. The round manager is not
    /// started yet; call `start()`.
    pub fn new(
        config: ConsensusConfig,
        signer: Arc<dyn ValidatorSigner>,
        provider: &dyn ValidatorSetProvider,
        storage: Arc<dyn PersistentLivenessStorage>,
        state_computer: Arc<dyn StateComputer>,
        payload_client: Arc<dyn PayloadClient>,
        network: Arc<dyn NetworkSender>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid consensus config")?;
        let author = signer.author();

        let recovered = storage.recover().context("failed to read liveness storage")?;
        let (block_store, safety_data) = match recovered {
            Some(data) => {
                let epoch = data.root.epoch();
                let safety_data = data
                    .safety_data
                    .clone()
                    .filter(|s| s.epoch == epoch)
                    .unwrap_or_else(|| SafetyData::new(epoch));
                info!(
                    "{} recovering epoch {} (last voted round {})",
                    author, epoch, safety_data.last_voted_round
                );
                let store = BlockStore::recover(data, state_computer.clone(), storage.clone());
                (store, safety_data)
            }
            None => {
                let genesis = Block::make_genesis_block(GENESIS_EPOCH, None);
                let genesis_qc = genesis.quorum_cert().clone();
                let safety_data = SafetyData::new(GENESIS_EPOCH);
                storage
                    .reset_for_epoch(&safety_data, &genesis, &genesis_qc)
                    .context("failed to initialize liveness storage")?;
                info!("{} starting from genesis {}", author, genesis.id());
                let store = BlockStore::new(genesis, genesis_qc, state_computer.clone(), storage.clone());
                (store, safety_data)
            }
        };

        let epoch = block_store.epoch();
        let validators = provider
            .validators(epoch)
            .ok_or_else(|| anyhow!("no validator set known for epoch {}", epoch))?;
        let epoch_state = EpochState::new(epoch, validators);
        if !epoch_state.verifier.contains(&author) {
            warn!("{} is not a validator in epoch {}", author, epoch);
        }
        let safety_rules = SafetyRules::new(signer.clone(), storage.clone(), safety_data);
        let round_manager = RoundManager::new(
            epoch_state,
            config.clone(),
            block_store,
            safety_rules,
            payload_client.clone(),
            network.clone(),
        );

        Ok(Self {
            author,
            config,
            signer,
            storage,
            state_computer,
            payload_client,
            network,
            round_manager,
            previous_store: None,
            epoch_changes: BTreeMap::new(),
            future_messages: VecDeque::new(),
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let result = self.round_manager.start();
        self.after_event(result)
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn epoch(&self) -> Epoch {
        self.round_manager.epoch()
    }

    pub fn round_manager(&self) -> &RoundManager {
        &self.round_manager
    }

    pub fn round_manager_mut(&mut self) -> &mut RoundManager {
        &mut self.round_manager
    }

    pub fn status(&self) -> ConsensusStatus {
        self.round_manager.status()
    }

    pub fn round_deadline(&self) -> Option<Instant> {
        self.round_manager.round_deadline()
    }

    /// Route one inbound message. Only fatal conditions are returned;
    /// everything else has already been logged by the round manager.
    pub fn process_message(&mut self, sender: Author, msg: ConsensusMsg) -> anyhow::Result<()> {
        if let ConsensusMsg::BlockRetrievalRequest(request) = msg {
            self.process_block_retrieval(sender, request);
            return Ok(());
        }

        let current = self.epoch();
        match msg.epoch() {
            Some(epoch) if epoch < current => {
                if let ConsensusMsg::EpochChange(_) = msg {
                    return Ok(());
                }
                debug!("{} is still in epoch {}; current is {}", sender, epoch, current);
                if let Some(change) = self.epoch_changes.get(&epoch) {
                    self.send(sender, ConsensusMsg::EpochChange(change.clone()));
                }
                Ok(())
            }
            Some(epoch) if epoch == current + 1 => {
                debug!("holding {} for epoch {} from {}", msg.name(), epoch, sender);
                let capacity = self.config.max_future_epoch_messages;
                if capacity > 0 {
                    if self.future_messages.len() >= capacity {
                        self.future_messages.pop_front();
                    }
                    self.future_messages.push_back((sender, msg));
                }
                Ok(())
            }
            Some(epoch) if epoch > current => {
                debug!("dropping {} for future epoch {} from {}", msg.name(), epoch, sender);
                Ok(())
            }
            _ => {
                let result = self.round_manager.process_message(sender, msg);
                self.after_event(result)
            }
        }
    }

    pub fn process_local_timeout(&mut self, round: Round) -> anyhow::Result<()> {
        let result = self.round_manager.process_local_timeout(round);
        self.after_event(result)
    }

    /// Close the current epoch and start `new_epoch` with `new_validator_set`.
    ///
    /// The new genesis is anchored at the current root, which is the
    /// reconfiguration block once it has committed.
    pub fn apply_reconfiguration(
        &mut self,
        new_validator_set: ValidatorSet,
        new_epoch: Epoch,
    ) -> anyhow::Result<()> {
        let old_epoch = self.epoch();
        if new_epoch <= old_epoch {
            bail!("cannot move from epoch {} to epoch {}", old_epoch, new_epoch);
        }
        let old_store = self.round_manager.block_store();
        let anchor = old_store.root().block_info();
        let commit_qc = old_store.highest_commit_qc().clone();

        let genesis = Block::make_genesis_block(new_epoch, Some(&anchor));
        let genesis_qc = genesis.quorum_cert().clone();
        let safety_data = SafetyData::new(new_epoch);
        self.storage
            .reset_for_epoch(&safety_data, &genesis, &genesis_qc)
            .context("failed to reset liveness storage for the new epoch")?;

        let block_store = BlockStore::new(
            genesis,
            genesis_qc,
            self.state_computer.clone(),
            self.storage.clone(),
        );
        let safety_rules = SafetyRules::new(self.signer.clone(), self.storage.clone(), safety_data);
        let round_manager = RoundManager::new(
            EpochState::new(new_epoch, new_validator_set),
            self.config.clone(),
            block_store,
            safety_rules,
            self.payload_client.clone(),
            self.network.clone(),
        );
        let old = std::mem::replace(&mut self.round_manager, round_manager);
        self.previous_store = Some(old.into_block_store());

        info!(
            "{} entered epoch {} anchored at {} (round {})",
            self.author, new_epoch, anchor.id, anchor.round
        );
        let change = EpochChangeMsg::new(commit_qc);
        self.epoch_changes.insert(old_epoch, change.clone());
        if let Err(e) = self.network.broadcast(ConsensusMsg::EpochChange(change)) {
            warn!("{} failed to announce epoch change: {}", self.author, e);
        }

        let result = self.round_manager.start();
        self.after_event(result)?;
        self.replay_future_messages()
    }

    /// Feed held messages that now belong to the current epoch
    fn replay_future_messages(&mut self) -> anyhow::Result<()> {
        for (sender, msg) in std::mem::take(&mut self.future_messages) {
            match msg.epoch() {
                Some(epoch) if epoch < self.epoch() => {}
                _ => self.process_message(sender, msg)?,
            }
        }
        Ok(())
    }

    /// Escalate safety alarms and run any reconfiguration the event committed
    fn after_event(&mut self, result: RoundResult<()>) -> anyhow::Result<()> {
        if let Err(e) = result {
            if e.kind() == ErrorKind::SafetyViolation {
                return Err(anyhow::Error::new(e)
                    .context(format!("safety violation in epoch {}", self.epoch())));
            }
        }
        if let Some(reconfiguration) = self.round_manager.take_reconfiguration() {
            let next_epoch = self.epoch() + 1;
            self.apply_reconfiguration(reconfiguration.validators, next_epoch)?;
        }
        Ok(())
    }

    /// Serve from the current tree, falling back to the previous epoch's
    fn process_block_retrieval(&self, sender: Author, request: BlockRetrievalRequest) {
        let max = self.config.max_blocks_per_retrieval;
        let mut response = sync::process_block_retrieval(self.round_manager.block_store(), &request, max);
        if response.status == BlockRetrievalStatus::IdNotFound {
            if let Some(previous) = &self.previous_store {
                response = sync::process_block_retrieval(previous, &request, max);
            }
        }
        self.send(sender, ConsensusMsg::BlockRetrievalResponse(response));
    }

    fn send(&self, recipient: Author, msg: ConsensusMsg) {
        if let Err(e) = self.network.send_to(recipient, msg) {
            warn!("{} failed to send to {}: {}", self.author, recipient, e);
        }
    }
}
