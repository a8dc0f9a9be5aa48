//! Vote aggregation benchmarks.
//!
//! Measures:
//! - Collecting votes into a QC (per-vote verification included)
//! - Verifying a finished QC against the epoch's validator set
//! - Committee sizes: 4, 16, 64

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hotstuff_consensus::crypto::{BLSKeyPair, BlsSigner};
use hotstuff_consensus::hotstuff::{
    Block, EpochState, ExecutedBlock, PendingVotes, QuorumCert, ValidatorSet, Vote,
    VoteAddedResult,
};
use hotstuff_consensus::ledger::{InMemoryLedger, StateComputer};

fn make_committee(n: u64) -> (Vec<BlsSigner>, EpochState) {
    let signers: Vec<BlsSigner> = (0..n)
        .map(|i| BlsSigner::new(BLSKeyPair::from_seed(i).expect("keygen")))
        .collect();
    let set = ValidatorSet::from_public_keys(
        signers.iter().map(|s| s.keypair().public_key.clone()).collect(),
    )
    .expect("validator set");
    (signers, EpochState::new(1, set))
}

fn make_votes(signers: &[BlsSigner]) -> (Block, Vec<Vote>) {
    let genesis = Block::make_genesis_block(1, None);
    let block = Block::new_proposal(
        vec![b"bench".to_vec()],
        1,
        1_000,
        genesis.quorum_cert().clone(),
        &signers[0],
    )
    .expect("proposal");
    let parent_state = genesis.quorum_cert().certified_block().executed_state_id;
    let result = InMemoryLedger::new()
        .compute(&block, parent_state)
        .expect("execution");
    let vote_data = ExecutedBlock::new(block.clone(), result).vote_data();
    let votes = signers
        .iter()
        .map(|s| Vote::new(vote_data.clone(), s).expect("vote"))
        .collect();
    (block, votes)
}

fn aggregate(votes: &[Vote], epoch_state: &EpochState) -> Option<QuorumCert> {
    let mut pending = PendingVotes::new();
    for vote in votes {
        if let Ok(VoteAddedResult::QcReady(qc)) = pending.add_vote(vote, &epoch_state.verifier) {
            return Some(qc);
        }
    }
    None
}

fn bench_vote_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("consensus/vote_aggregation");
    group.sample_size(20);

    for &n in &[4u64, 16, 64] {
        let (signers, epoch_state) = make_committee(n);
        let (_, votes) = make_votes(&signers);
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &votes, |b, votes| {
            b.iter(|| aggregate(votes, &epoch_state).expect("quorum"));
        });
    }
    group.finish();
}

fn bench_qc_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("consensus/qc_verify");

    for &n in &[4u64, 16, 64] {
        let (signers, epoch_state) = make_committee(n);
        let (_, votes) = make_votes(&signers);
        let qc = aggregate(&votes, &epoch_state).expect("quorum");
        group.bench_with_input(BenchmarkId::from_parameter(n), &qc, |b, qc| {
            b.iter(|| qc.verify(&epoch_state).expect("valid qc"));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_vote_aggregation, bench_qc_verification);
criterion_main!(benches);
