use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness of a peer as seen from the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Alive,
    Suspect,
    Dead,
}

impl State {
    /// Alive and Suspect nodes still participate in probing and gossip.
    pub(crate) fn is_active(&self) -> bool {
        matches!(self, State::Alive | State::Suspect)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Alive => write!(f, "alive"),
            State::Suspect => write!(f, "suspect"),
            State::Dead => write!(f, "dead"),
        }
    }
}
