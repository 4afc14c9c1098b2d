use std::collections::HashMap;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

use crate::message::PushNodeState;
use crate::node::{Node, NodeMetadata, NodeState};
use crate::state::State;

/// The local view of every known peer.
///
/// The table keeps two coherent views of the same records: a name index for
/// O(1) lookup and an ordered sequence used for round-robin probing and
/// random sampling. Every mutation goes through `&mut self`, so the caller's
/// single readers-writer lock covers both views at once.
pub(crate) struct NodeTable<M>
where
    M: NodeMetadata,
{
    node_map: HashMap<String, usize>,
    nodes: Vec<NodeState<M>>,

    /// Position of the next probe candidate in `nodes`.
    probe_index: usize,
}

impl<M: NodeMetadata> NodeTable<M> {
    pub(crate) fn new() -> Self {
        Self {
            node_map: HashMap::new(),
            nodes: Vec::new(),
            probe_index: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.node_map.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&NodeState<M>> {
        self.node_map.get(name).map(|&idx| &self.nodes[idx])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut NodeState<M>> {
        match self.node_map.get(name) {
            Some(&idx) => Some(&mut self.nodes[idx]),
            None => None,
        }
    }

    /// Inserts a first-seen peer.
    ///
    /// The record is appended and then swapped with a uniformly random
    /// earlier slot. When many nodes join at once this makes the probe
    /// order diverge across the cluster instead of every member probing in
    /// insertion order.
    pub(crate) fn insert(&mut self, state: NodeState<M>) {
        debug_assert!(!self.contains(state.name()));

        let tail = self.nodes.len();
        self.node_map.insert(state.name().to_string(), tail);
        self.nodes.push(state);

        if tail > 0 {
            let offset = thread_rng().gen_range(0..tail);
            self.swap(offset, tail);
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.node_map.insert(self.nodes[a].name().to_string(), a);
        self.node_map.insert(self.nodes[b].name().to_string(), b);
    }

    /// Picks the next peer to probe, advancing the round-robin index and
    /// skipping ourselves and dead records. Wrapping the end of the
    /// sequence triggers [`NodeTable::reset_nodes`]. Returns `None` when a
    /// full pass finds nothing probeable.
    pub(crate) fn next_probe_target(&mut self, local_name: &str) -> Option<NodeState<M>> {
        let mut checked = 0;
        loop {
            if checked >= self.nodes.len() {
                return None;
            }

            if self.probe_index >= self.nodes.len() {
                self.reset_nodes();
                checked += 1;
                continue;
            }

            let candidate = &self.nodes[self.probe_index];
            if candidate.name() == local_name || candidate.is_dead() {
                self.probe_index += 1;
                checked += 1;
                continue;
            }

            let chosen = candidate.clone();
            self.probe_index += 1;
            return Some(chosen);
        }
    }

    /// Reaps dead records and reshuffles the survivors.
    ///
    /// Dead entries leave both views at the same instant; the remaining
    /// live records are shuffled so the next probe round visits them in a
    /// fresh order. The probe index restarts from the front.
    pub(crate) fn reset_nodes(&mut self) {
        for state in self.nodes.iter().filter(|s| s.is_dead()) {
            self.node_map.remove(state.name());
        }
        self.nodes.retain(|s| s.state.is_active());

        self.nodes.shuffle(&mut thread_rng());
        for (idx, state) in self.nodes.iter().enumerate() {
            self.node_map.insert(state.name().to_string(), idx);
        }

        self.probe_index = 0;
    }

    /// Uniform sample of up to `k` alive peers, excluding the given names,
    /// without replacement.
    pub(crate) fn k_random_nodes(&self, k: usize, excludes: &[&str]) -> Vec<Node<M>> {
        let mut eligible: Vec<&NodeState<M>> = self
            .nodes
            .iter()
            .filter(|s| s.is_alive() && !excludes.contains(&s.name()))
            .collect();

        eligible.shuffle(&mut thread_rng());
        eligible.truncate(k);
        eligible.into_iter().map(|s| s.node.clone()).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<NodeState<M>> {
        self.nodes.to_vec()
    }

    /// All records in their wire form, for a full state exchange.
    pub(crate) fn push_states(&self) -> Result<Vec<PushNodeState>> {
        self.nodes.iter().map(|s| s.push_state()).collect()
    }
}
