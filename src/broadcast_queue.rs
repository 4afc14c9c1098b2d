use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

use anyhow::Result;
use parking_lot::RwLock;
use tokio_util::bytes::Bytes;

/// Outbound queue of encoded membership updates awaiting gossip.
///
/// Entries are keyed by node name: a newer update about a node replaces the
/// older one, so the queue never grows beyond the number of known nodes.
/// Fetching prefers the least-transmitted entries and counts each fetch
/// against a per-entry retransmit limit.
pub trait BroadcastQueue: Send + Sync {
    /// Enqueues `msg` under `key`, superseding any queued update for the
    /// same key.
    fn queue_broadcast(&self, key: String, msg: Bytes) -> Result<()>;

    /// Returns a batch of queued messages fitting within `limit` bytes,
    /// charging `overhead` bytes of framing per message. Each returned
    /// message has its transmit count incremented; entries that reach the
    /// retransmit limit are dropped from the queue.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Result<Vec<Bytes>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Rescales the retransmit limit for a new cluster size.
    fn set_cluster_size(&self, size: usize) -> Result<()>;
}

#[derive(Debug, Clone)]
struct QueuedBroadcast {
    msg: Bytes,
    transmits: u32,
    id: u64,
}

impl PartialEq for QueuedBroadcast {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedBroadcast {}

impl Ord for QueuedBroadcast {
    /// Fewest transmits first; newer entries break ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.transmits
            .cmp(&other.transmits)
            .then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueuedBroadcast {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The default [`BroadcastQueue`] implementation.
pub struct DefaultBroadcastQueue {
    queue: RwLock<BTreeMap<String, QueuedBroadcast>>,
    max_retransmits: AtomicU32,
    next_id: AtomicU64,
}

impl DefaultBroadcastQueue {
    pub fn new(initial_cluster_size: usize) -> Self {
        Self {
            queue: RwLock::new(BTreeMap::new()),
            max_retransmits: AtomicU32::new(Self::calculate_max_retransmits(initial_cluster_size)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Retransmit limit scales with the logarithm of the cluster size, the
    /// usual epidemic dissemination bound.
    fn calculate_max_retransmits(cluster_size: usize) -> u32 {
        (cluster_size.max(1) as f32).log2().ceil() as u32 + 1
    }
}

impl BroadcastQueue for DefaultBroadcastQueue {
    fn queue_broadcast(&self, key: String, msg: Bytes) -> Result<()> {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.write().insert(
            key,
            QueuedBroadcast {
                msg,
                transmits: 0,
                id,
            },
        );
        Ok(())
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Result<Vec<Bytes>> {
        let mut queue = self.queue.write();
        let max_retransmits = self.max_retransmits.load(AtomicOrdering::Relaxed);

        let mut keys: Vec<String> = queue.keys().cloned().collect();
        keys.sort_by(|a, b| queue[a].cmp(&queue[b]));

        let mut used = 0;
        let mut batch = Vec::new();
        for key in keys {
            let entry = match queue.get_mut(&key) {
                Some(entry) => entry,
                None => continue,
            };
            if used + overhead + entry.msg.len() > limit {
                continue;
            }

            used += overhead + entry.msg.len();
            batch.push(entry.msg.clone());
            entry.transmits += 1;
            if entry.transmits >= max_retransmits {
                queue.remove(&key);
            }
        }

        Ok(batch)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.queue.read().len())
    }

    fn set_cluster_size(&self, size: usize) -> Result<()> {
        self.max_retransmits.store(
            Self::calculate_max_retransmits(size),
            AtomicOrdering::Relaxed,
        );
        Ok(())
    }
}
