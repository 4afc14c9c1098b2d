use tokio::sync::mpsc;
use tracing::debug;

use crate::node::{Node, NodeMetadata};

/// Lifecycle notification channels.
///
/// A node value is delivered on the join channel when a peer enters the
/// cluster (or returns from the dead) and on the leave channel when a peer
/// is declared dead. Sends never block: a full or closed channel drops the
/// notification rather than stalling the protocol.
pub struct Notifier<M = crate::node::DefaultMetadata>
where
    M: NodeMetadata,
{
    join_tx: Option<mpsc::Sender<Node<M>>>,
    leave_tx: Option<mpsc::Sender<Node<M>>>,
}

impl<M: NodeMetadata> Notifier<M> {
    pub fn new(join_tx: Option<mpsc::Sender<Node<M>>>, leave_tx: Option<mpsc::Sender<Node<M>>>) -> Self {
        Self { join_tx, leave_tx }
    }

    /// A notifier that reports nothing.
    pub fn none() -> Self {
        Self {
            join_tx: None,
            leave_tx: None,
        }
    }

    pub(crate) fn notify_join(&self, node: &Node<M>) {
        if let Some(tx) = &self.join_tx {
            if tx.try_send(node.clone()).is_err() {
                debug!(node = %node.name, "join notification dropped");
            }
        }
    }

    pub(crate) fn notify_leave(&self, node: &Node<M>) {
        if let Some(tx) = &self.leave_tx {
            if tx.try_send(node.clone()).is_err() {
                debug!(node = %node.name, "leave notification dropped");
            }
        }
    }
}
