// Network layer seam for consensus
//
// The engine only ever hands messages to a `NetworkSender` and reads
// `(sender, message)` pairs from an inbound channel. Transport, framing
// and peer discovery live outside this crate; `ChannelNetwork` wires
// nodes together in-process for simulation and tests.

pub mod types;

use crate::hotstuff::types::Author;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub use types::{ConsensusMsg, EpochChangeMsg, Inbound, ProposalMsg, VoteMsg};

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Peer not found: {0}")]
    PeerNotFound(Author),
    #[error("Channel to {0} is closed")]
    ChannelClosed(Author),
    #[error("Link to {0} is down")]
    LinkDown(Author),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Outbound half of the network as seen by consensus
pub trait NetworkSender: Send + Sync {
    /// Send to every validator except self
    fn broadcast(&self, msg: ConsensusMsg) -> NetworkResult<()>;

    /// `recipient` may be self; the message then loops back to the
    /// sender's own inbound queue.
    fn send_to(&self, recipient: Author, msg: ConsensusMsg) -> NetworkResult<()>;
}

/// Counters for one node's outbound traffic
#[derive(Debug, Default)]
pub struct NetworkStats {
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
}

/// Links cut between pairs of nodes, shared by all nodes of a hub
type Partitions = Arc<RwLock<HashSet<(Author, Author)>>>;

/// In-process network over unbounded tokio channels
pub struct ChannelNetwork {
    author: Author,
    peers: HashMap<Author, mpsc::UnboundedSender<Inbound>>,
    partitions: Partitions,
    stats: Arc<NetworkStats>,
}

impl ChannelNetwork {
    /// Connect `authors` in a full mesh. Returns one network handle and
    /// one inbound receiver per author, in the same order.
    pub fn build(authors: &[Author]) -> Vec<(ChannelNetwork, mpsc::UnboundedReceiver<Inbound>)> {
        let partitions: Partitions = Arc::new(RwLock::new(HashSet::new()));
        let (senders, receivers): (Vec<_>, Vec<_>) =
            authors.iter().map(|_| mpsc::unbounded_channel()).unzip();
        let peers: HashMap<Author, mpsc::UnboundedSender<Inbound>> =
            authors.iter().copied().zip(senders).collect();

        authors
            .iter()
            .zip(receivers)
            .map(|(author, rx)| {
                let network = ChannelNetwork {
                    author: *author,
                    peers: peers.clone(),
                    partitions: partitions.clone(),
                    stats: Arc::new(NetworkStats::default()),
                };
                (network, rx)
            })
            .collect()
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn stats(&self) -> Arc<NetworkStats> {
        self.stats.clone()
    }

    fn link_up(&self, a: Author, b: Author) -> bool {
        let partitions = self
            .partitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !partitions.contains(&(a, b)) && !partitions.contains(&(b, a))
    }

    /// Cut the link between `a` and `b` in both directions
    pub fn disconnect(&self, a: Author, b: Author) {
        self.partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((a, b));
    }

    /// Restore every cut link
    pub fn heal(&self) {
        self.partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Cut `author` off from every peer
    pub fn isolate(&self, author: Author) {
        let mut partitions = self
            .partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for peer in self.peers.keys().filter(|p| **p != author) {
            partitions.insert((author, *peer));
        }
    }

    fn deliver(&self, recipient: Author, msg: ConsensusMsg) -> NetworkResult<()> {
        if !self.link_up(self.author, recipient) {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Dropping {} to {}: link down", msg, recipient);
            return Err(NetworkError::LinkDown(recipient));
        }
        let channel = self
            .peers
            .get(&recipient)
            .ok_or(NetworkError::PeerNotFound(recipient))?;
        channel
            .send((self.author, msg))
            .map_err(|_| NetworkError::ChannelClosed(recipient))?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl NetworkSender for ChannelNetwork {
    fn broadcast(&self, msg: ConsensusMsg) -> NetworkResult<()> {
        let mut result = Ok(());
        for peer in self.peers.keys().filter(|p| **p != self.author) {
            match self.deliver(*peer, msg.clone()) {
                Ok(()) => {}
                // A cut link is a simulated loss, not a failure
                Err(NetworkError::LinkDown(_)) => {}
                Err(e) => {
                    debug!("Broadcast of {} to {} failed: {}", msg, peer, e);
                    result = Err(e);
                }
            }
        }
        result
    }

    fn send_to(&self, recipient: Author, msg: ConsensusMsg) -> NetworkResult<()> {
        self.deliver(recipient, msg)
    }
}
