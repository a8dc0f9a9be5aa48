/// Catch-up: SyncInfo exchange and block retrieval
/// 
/// Nodes attach a `SyncInfo` to proposals and votes, and send it on its
/// own when a peer looks behind. Certificates that reference unknown
/// blocks are resolved by fetching the missing ancestors from the peer.

pub mod types;

use crate::hotstuff::block_store::BlockStore;
use crate::hotstuff::quorum_cert::{QuorumCert, TimeoutCertificate};
use crate::hotstuff::types::{Author, BlockId, Epoch, Round};
use crate::hotstuff::validator::{EpochState, VerifyError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

pub use types::{BlockRetrievalRequest, BlockRetrievalResponse, BlockRetrievalStatus};

/// Highest certificates a node knows about
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    highest_qc: QuorumCert,
    highest_commit_qc: QuorumCert,
    highest_timeout_cert: Option<TimeoutCertificate>,
}

impl SyncInfo {
    /// A timeout certificate no higher than the highest QC adds nothing
    /// and is dropped.
    pub fn new(
        highest_qc: QuorumCert,
        highest_commit_qc: QuorumCert,
        highest_timeout_cert: Option<TimeoutCertificate>,
    ) -> Self {
        let highest_timeout_cert =
            highest_timeout_cert.filter(|tc| tc.round() > highest_qc.round());
        Self {
            highest_qc,
            highest_commit_qc,
            highest_timeout_cert,
        }
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

    pub fn highest_certified_round(&self) -> Round {
        self.highest_qc.round()
    }

    pub fn highest_timeout_round(&self) -> Round {
        self.highest_timeout_cert.as_ref().map_or(0, |tc| tc.round())
    }

    pub fn highest_commit_round(&self) -> Round {
        self.highest_commit_qc.round()
    }

    /// The round a node holding these certificates can enter, minus one
    pub fn highest_round(&self) -> Round {
        self.highest_certified_round().max(self.highest_timeout_round())
    }

    pub fn epoch(&self) -> Epoch {
        self.highest_qc.epoch()
    }

    /// Verify every certificate and the ordering between them
    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        let epoch = self.epoch();
        epoch_state.ensure_epoch(epoch)?;
        epoch_state.ensure_epoch(self.highest_commit_qc.epoch())?;
        if let Some(tc) = &self.highest_timeout_cert {
            epoch_state.ensure_epoch(tc.epoch())?;
        }
        if self.highest_commit_qc.round() > self.highest_qc.round() {
            return Err(VerifyError::Malformed(format!(
                "commit QC round {} above highest QC round {}",
                self.highest_commit_qc.round(),
                self.highest_qc.round()
            )));
        }

        self.highest_qc.verify(epoch_state)?;
        if self.highest_commit_qc != self.highest_qc {
            self.highest_commit_qc.verify(epoch_state)?;
        }
        if let Some(tc) = &self.highest_timeout_cert {
            tc.verify(epoch_state)?;
        }
        Ok(())
    }

    /// Whether this carries any certificate higher than `other`'s
    pub fn has_newer_certificates(&self, other: &SyncInfo) -> bool {
        self.highest_certified_round() > other.highest_certified_round()
            || self.highest_timeout_round() > other.highest_timeout_round()
            || self.highest_commit_round() > other.highest_commit_round()
    }
}

impl fmt::Debug for SyncInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for SyncInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncInfo[epoch: {}, HQC: {}, HCC: {}, HTC: {}]",
            self.epoch(),
            self.highest_certified_round(),
            self.highest_commit_round(),
            self.highest_timeout_round()
        )
    }
}

/// Serve a retrieval request from the local tree, including recently
/// committed blocks that have been pruned.
pub fn process_block_retrieval(
    store: &BlockStore,
    request: &BlockRetrievalRequest,
    max_blocks_per_retrieval: u64,
) -> BlockRetrievalResponse {
    let limit = request.num_blocks.min(max_blocks_per_retrieval);
    let mut blocks = Vec::new();
    let mut id = request.block_id;
    while (blocks.len() as u64) < limit {
        match store.get_block_for_retrieval(&id) {
            Some(block) => {
                id = block.parent_id();
                let genesis = block.is_genesis();
                blocks.push(block.clone());
                if genesis {
                    break;
                }
            }
            None => break,
        }
    }

    let status = if blocks.is_empty() {
        BlockRetrievalStatus::IdNotFound
    } else if (blocks.len() as u64) < request.num_blocks {
        BlockRetrievalStatus::NotEnoughBlocks
    } else {
        BlockRetrievalStatus::Succeeded
    };
    debug!(
        "Serving {} blocks from {} ({:?})",
        blocks.len(),
        request.block_id,
        status
    );
    BlockRetrievalResponse::new(status, blocks)
}

/// Tracks outstanding retrieval requests so the same block is not
/// fetched from several peers at once.
pub struct BlockFetcher {
    request_timeout: Duration,
    pending: HashMap<BlockId, PendingRetrieval>,
}

#[derive(Clone, Debug)]
pub struct PendingRetrieval {
    pub peer: Author,
    pub request: BlockRetrievalRequest,
    started_at: Instant,
}

impl BlockFetcher {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            pending: HashMap::new(),
        }
    }

    /// Returns the request to send to `peer`, or `None` if a fetch for
    /// `block_id` is still in flight.
    pub fn request(
        &mut self,
        block_id: BlockId,
        num_blocks: u64,
        peer: Author,
    ) -> Option<BlockRetrievalRequest> {
        let now = Instant::now();
        if let Some(pending) = self.pending.get(&block_id) {
            if now.duration_since(pending.started_at) < self.request_timeout {
                return None;
            }
        }
        let request = BlockRetrievalRequest::new(block_id, num_blocks);
        self.pending.insert(
            block_id,
            PendingRetrieval {
                peer,
                request: request.clone(),
                started_at: now,
            },
        );
        Some(request)
    }

    /// Take the request for `block_id` out of the in-flight set
    pub fn complete(&mut self, block_id: &BlockId) -> Option<PendingRetrieval> {
        self.pending.remove(block_id)
    }

    /// Drop every request sent to `peer`; returns the block ids asked for
    pub fn abandon_peer(&mut self, peer: Author) -> Vec<BlockId> {
        let ids: Vec<BlockId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids
    }

    /// Forget requests whose block arrived some other way and requests
    /// that went unanswered past the timeout. Returns how many were dropped.
    pub fn expire(&mut self, is_known: impl Fn(&BlockId) -> bool) -> usize {
        let now = Instant::now();
        let timeout = self.request_timeout;
        let before = self.pending.len();
        self.pending
            .retain(|id, p| !is_known(id) && now.duration_since(p.started_at) < timeout);
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::block::Block;
    use crate::hotstuff::test_utils::TestCommittee;
    use crate::ledger::InMemoryLedger;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn store_with_chain(committee: &TestCommittee, rounds: Round) -> (BlockStore, Vec<Block>, Vec<QuorumCert>) {
        let genesis = committee.genesis().clone();
        let qc = genesis.quorum_cert().clone();
        let mut store = BlockStore::new(
            genesis,
            qc,
            Arc::new(InMemoryLedger::new()),
            Arc::new(MemoryStorage::new()),
        );
        let (blocks, qcs) = committee.certified_chain(rounds);
        for block in &blocks {
            store.insert_quorum_cert(block.quorum_cert()).unwrap();
            store.insert_block(block.clone()).unwrap();
        }
        (store, blocks, qcs)
    }

    #[test]
    fn test_new_drops_stale_timeout_cert() {
        let committee = TestCommittee::new(4);
        let (_, qcs) = committee.certified_chain(3);
        let genesis_qc = committee.genesis().quorum_cert().clone();

        let info = SyncInfo::new(qcs[2].clone(), genesis_qc.clone(), Some(committee.make_tc(2, &[0, 1, 2])));
        assert!(info.highest_timeout_cert().is_none());
        assert_eq!(info.highest_round(), 3);

        let info = SyncInfo::new(qcs[2].clone(), genesis_qc, Some(committee.make_tc(5, &[0, 1, 2])));
        assert_eq!(info.highest_timeout_round(), 5);
        assert_eq!(info.highest_round(), 5);
    }

    #[test]
    fn test_verify_accepts_valid_sync_info() {
        let committee = TestCommittee::new(4);
        let (_, qcs) = committee.certified_chain(3);
        let info = SyncInfo::new(qcs[2].clone(), qcs[0].clone(), Some(committee.make_tc(4, &[1, 2, 3])));
        info.verify(&committee.epoch_state).unwrap();
    }

    #[test]
    fn test_verify_rejects_commit_above_highest() {
        let committee = TestCommittee::new(4);
        let (_, qcs) = committee.certified_chain(3);
        let info = SyncInfo::new(qcs[0].clone(), qcs[2].clone(), None);
        assert!(matches!(
            info.verify(&committee.epoch_state),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn test_verify_rejects_other_epoch() {
        let committee = TestCommittee::new(4);
        let other = TestCommittee::with_epoch(4, 2);
        let (_, qcs) = other.certified_chain(1);
        let info = SyncInfo::new(qcs[0].clone(), qcs[0].clone(), None);
        assert!(matches!(
            info.verify(&committee.epoch_state),
            Err(VerifyError::EpochMismatch { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_has_newer_certificates() {
        let committee = TestCommittee::new(4);
        let (_, qcs) = committee.certified_chain(3);
        let behind = SyncInfo::new(qcs[0].clone(), qcs[0].clone(), None);
        let ahead = SyncInfo::new(qcs[2].clone(), qcs[0].clone(), None);
        assert!(ahead.has_newer_certificates(&behind));
        assert!(!behind.has_newer_certificates(&ahead));
        assert!(!ahead.has_newer_certificates(&ahead.clone()));
    }

    #[test]
    fn test_retrieval_walks_parents_newest_first() {
        let committee = TestCommittee::new(4);
        let (store, blocks, _) = store_with_chain(&committee, 3);

        let request = BlockRetrievalRequest::new(blocks[2].id(), 2);
        let response = process_block_retrieval(&store, &request, 100);
        assert_eq!(response.status, BlockRetrievalStatus::Succeeded);
        assert_eq!(response.blocks, vec![blocks[2].clone(), blocks[1].clone()]);
        response.verify(&request, &committee.epoch_state).unwrap();
    }

    #[test]
    fn test_retrieval_stops_at_genesis() {
        let committee = TestCommittee::new(4);
        let (store, blocks, _) = store_with_chain(&committee, 2);

        let request = BlockRetrievalRequest::new(blocks[1].id(), 10);
        let response = process_block_retrieval(&store, &request, 100);
        assert_eq!(response.status, BlockRetrievalStatus::NotEnoughBlocks);
        assert_eq!(response.blocks.len(), 3);
        assert!(response.blocks[2].is_genesis());
        response.verify(&request, &committee.epoch_state).unwrap();
    }

    #[test]
    fn test_retrieval_respects_server_limit() {
        let committee = TestCommittee::new(4);
        let (store, blocks, _) = store_with_chain(&committee, 3);
        let request = BlockRetrievalRequest::new(blocks[2].id(), 3);
        let response = process_block_retrieval(&store, &request, 1);
        assert_eq!(response.blocks.len(), 1);
        assert_eq!(response.status, BlockRetrievalStatus::NotEnoughBlocks);
    }

    #[test]
    fn test_retrieval_unknown_block() {
        let committee = TestCommittee::new(4);
        let (store, _, _) = store_with_chain(&committee, 1);
        let other = committee.make_block(2, 7, committee.genesis().quorum_cert());
        let response = process_block_retrieval(&store, &BlockRetrievalRequest::new(other.id(), 1), 100);
        assert_eq!(response.status, BlockRetrievalStatus::IdNotFound);
        assert!(response.blocks.is_empty());
    }

    #[test]
    fn test_response_verify_rejects_broken_chain() {
        let committee = TestCommittee::new(4);
        let (_, blocks, _) = store_with_chain(&committee, 3);
        let request = BlockRetrievalRequest::new(blocks[2].id(), 2);
        let response = BlockRetrievalResponse::new(
            BlockRetrievalStatus::Succeeded,
            vec![blocks[2].clone(), blocks[0].clone()],
        );
        assert!(response.verify(&request, &committee.epoch_state).is_err());
    }

    #[test]
    fn test_fetcher_dedups_in_flight_requests() {
        let committee = TestCommittee::new(4);
        let mut fetcher = BlockFetcher::new(Duration::from_secs(10));
        let id = committee.genesis().id();

        assert!(fetcher.request(id, 5, committee.author(1)).is_some());
        assert!(fetcher.request(id, 5, committee.author(2)).is_none());
        assert_eq!(fetcher.pending_count(), 1);
        let pending = fetcher.complete(&id).unwrap();
        assert_eq!(pending.peer, committee.author(1));
        assert_eq!(pending.request, BlockRetrievalRequest::new(id, 5));
        assert_eq!(fetcher.pending_count(), 0);
    }

    #[test]
    fn test_fetcher_abandons_peer() {
        let committee = TestCommittee::new(4);
        let (_, blocks, _) = store_with_chain(&committee, 2);
        let mut fetcher = BlockFetcher::new(Duration::from_secs(10));
        fetcher.request(blocks[0].id(), 1, committee.author(1));
        fetcher.request(blocks[1].id(), 1, committee.author(2));

        assert_eq!(fetcher.abandon_peer(committee.author(1)), vec![blocks[0].id()]);
        assert_eq!(fetcher.pending_count(), 1);
        assert_eq!(fetcher.abandon_peer(committee.author(2)), vec![blocks[1].id()]);
        assert_eq!(fetcher.pending_count(), 0);
    }

    #[test]
    fn test_fetcher_expires_known_and_timed_out_requests() {
        let committee = TestCommittee::new(4);
        let (store, blocks, _) = store_with_chain(&committee, 2);
        let unknown = committee.make_block(2, 9, committee.genesis().quorum_cert());

        let mut fetcher = BlockFetcher::new(Duration::from_secs(10));
        fetcher.request(blocks[1].id(), 1, committee.author(1));
        fetcher.request(unknown.id(), 1, committee.author(2));
        assert_eq!(fetcher.expire(|id| store.block_exists(id)), 1);
        assert_eq!(fetcher.pending_count(), 1);
        assert!(fetcher.complete(&unknown.id()).is_some());

        let mut fetcher = BlockFetcher::new(Duration::ZERO);
        fetcher.request(unknown.id(), 1, committee.author(2));
        assert_eq!(fetcher.expire(|_| false), 1);
        assert_eq!(fetcher.pending_count(), 0);
    }

    #[test]
    fn test_fetcher_retries_after_timeout() {
        let committee = TestCommittee::new(4);
        let mut fetcher = BlockFetcher::new(Duration::ZERO);
        let id = committee.genesis().id();
        assert!(fetcher.request(id, 5, committee.author(1)).is_some());
        assert!(fetcher.request(id, 5, committee.author(2)).is_some());
    }
}
