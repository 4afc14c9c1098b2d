use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::trace;

/// What to do when the matching ack arrives.
enum AckAction {
    /// Non-blocking `true` to a waiter channel; the reaper sends `false`.
    Notify(mpsc::Sender<bool>),

    /// Arbitrary callback; the reaper fires nothing.
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct AckHandler {
    action: AckAction,
    reaper: Option<JoinHandle<()>>,
}

/// Pending ack waiters keyed by sequence number.
///
/// Each registration is consumed exactly once: either by the matching ack
/// or by its reap timer, never both. Both paths remove the entry under the
/// registry lock, so whichever gets there first wins. The lock is separate
/// from the node-table lock and is never held across an await.
pub(crate) struct AckRegistry {
    handlers: Mutex<HashMap<u32, AckHandler>>,
}

impl AckRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a waiter channel for `seq_no`. An ack delivers `true`; the
    /// reap timer removes the registration after `timeout` and delivers
    /// `false`. Both sends are non-blocking, so a bounded channel never
    /// stalls an ack path.
    pub(crate) fn set_ack_channel(
        self: &Arc<Self>,
        seq_no: u32,
        sender: mpsc::Sender<bool>,
        timeout: Duration,
    ) {
        self.register(seq_no, AckAction::Notify(sender), timeout);
    }

    /// Registers a callback for `seq_no`. The reap timer silently drops the
    /// registration after `timeout`.
    pub(crate) fn set_ack_handler<F>(self: &Arc<Self>, seq_no: u32, handler: F, timeout: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(seq_no, AckAction::Callback(Box::new(handler)), timeout);
    }

    fn register(self: &Arc<Self>, seq_no: u32, action: AckAction, timeout: Duration) {
        self.handlers.lock().insert(
            seq_no,
            AckHandler {
                action,
                reaper: None,
            },
        );

        let registry = Arc::clone(self);
        let reaper = tokio::spawn(async move {
            sleep(timeout).await;
            let reaped = registry.handlers.lock().remove(&seq_no);
            if let Some(handler) = reaped {
                trace!(seq_no, "reaping ack handler");
                if let AckAction::Notify(sender) = handler.action {
                    let _ = sender.try_send(false);
                }
            }
        });

        // The ack may already have raced us here and removed the entry; the
        // orphaned reaper then finds nothing and no-ops.
        if let Some(handler) = self.handlers.lock().get_mut(&seq_no) {
            handler.reaper = Some(reaper);
        }
    }

    /// Consumes the registration for `seq_no`, if any, cancelling its reap
    /// timer and firing the action.
    pub(crate) fn invoke_ack_handler(&self, seq_no: u32) {
        let handler = self.handlers.lock().remove(&seq_no);
        let Some(handler) = handler else {
            trace!(seq_no, "ack without matching handler");
            return;
        };

        if let Some(reaper) = handler.reaper {
            reaper.abort();
        }
        match handler.action {
            AckAction::Notify(sender) => {
                let _ = sender.try_send(true);
            }
            AckAction::Callback(callback) => callback(),
        }
    }

    /// Drops every outstanding registration and cancels its reap timer.
    pub(crate) fn clear(&self) {
        let mut handlers = self.handlers.lock();
        for (_, handler) in handlers.drain() {
            if let Some(reaper) = handler.reaper {
                reaper.abort();
            }
        }
    }
}
