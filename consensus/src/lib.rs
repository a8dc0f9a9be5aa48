/// HotStuff Consensus Layer
///
/// A chained HotStuff BFT engine in the DiemBFT style:
/// - BLS quorum certificates over a shared vote digest
/// - Three-chain commit rule over an arena block tree
/// - Pacemaker with timeout certificates and capped exponential backoff
/// - Persisted safety data so a restart never equivocates
/// - Validator set changes at epoch boundaries

pub mod config;
pub mod crypto;
pub mod hotstuff;
pub mod ledger;
pub mod network;
pub mod pacemaker;
pub mod storage;
pub mod sync;

pub use config::ConsensusConfig;
pub use crypto::{BLSPublicKey, BLSSecretKey, BLSSignature, Hash};
pub use hotstuff::engine::{ConsensusEngine, ConsensusHandle};
pub use hotstuff::epoch_manager::EpochManager;
pub use hotstuff::round_manager::{ConsensusStatus, RoundManager};
