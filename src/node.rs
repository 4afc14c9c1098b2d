use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::SystemTime;

use anyhow::Result;

use crate::message::PushNodeState;
use crate::state::State;

/// [`NodeMetadata`] is the application-defined payload carried alongside a
/// node's identity. The membership layer never interprets it; it only moves
/// the encoded bytes around the cluster.
pub trait NodeMetadata: Clone + Debug + Send + Sync + 'static {
    /// Serializes the metadata for the wire.
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Reconstructs the metadata from wire bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Empty metadata for clusters that only care about membership itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultMetadata;

impl NodeMetadata for DefaultMetadata {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn from_bytes(_bytes: &[u8]) -> Result<Self> {
        Ok(DefaultMetadata)
    }
}

/// A known peer: unique name, network address and opaque metadata.
#[derive(Debug, Clone)]
pub struct Node<M = DefaultMetadata>
where
    M: NodeMetadata,
{
    /// Unique name of the peer within the cluster.
    pub name: String,

    /// Address the peer listens on.
    pub addr: SocketAddr,

    /// Application metadata, opaque to the membership layer.
    pub metadata: M,
}

/// Local bookkeeping for a peer: the node itself plus the liveness view
/// we currently hold of it.
#[derive(Debug, Clone)]
pub(crate) struct NodeState<M = DefaultMetadata>
where
    M: NodeMetadata,
{
    pub(crate) node: Node<M>,

    /// Last incarnation number heard for this peer. Only ever increases.
    pub(crate) incarnation: u32,

    pub(crate) state: State,

    /// When `state` last changed value.
    pub(crate) state_change: SystemTime,
}

impl<M: NodeMetadata> NodeState<M> {
    pub(crate) fn new(node: Node<M>, incarnation: u32, state: State) -> Self {
        Self {
            node,
            incarnation,
            state,
            state_change: SystemTime::now(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.node.name
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.node.addr
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state == State::Alive
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state == State::Dead
    }

    /// Moves the record to `state`, stamping the change time only when the
    /// value actually changes.
    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            self.state = state;
            self.state_change = SystemTime::now();
        }
    }

    /// The wire form of this record used during full state exchanges.
    pub(crate) fn push_state(&self) -> Result<PushNodeState> {
        Ok(PushNodeState {
            name: self.node.name.clone(),
            addr: self.node.addr,
            meta: self.node.metadata.to_bytes()?,
            incarnation: self.incarnation,
            state: self.state,
        })
    }
}
