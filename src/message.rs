// Protocol messages and their wire identifiers.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::state::State;

/// Direct probe. The target answers with an [`Ack`] carrying the same
/// sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Ping {
    pub seq_no: u32,
}

/// Asks a peer to probe `target` on our behalf and relay the ack back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndirectPingReq {
    pub seq_no: u32,

    /// Address of the node the relay should ping.
    pub target: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Ack {
    pub seq_no: u32,
}

/// Claims `node` is alive at `incarnation`. Also doubles as the refutation
/// message a node broadcasts about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Suspect {
    pub incarnation: u32,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Dead {
    pub incarnation: u32,
    pub node: String,
}

/// One record of a full state exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    pub incarnation: u32,
    pub state: State,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PushPull {
    pub states: Vec<PushNodeState>,
}

#[derive(Debug, Clone)]
pub(crate) enum Message {
    Ping(Ping),
    IndirectPing(IndirectPingReq),
    Ack(Ack),
    Suspect(Suspect),
    Alive(Alive),
    Dead(Dead),
    PushPull(PushPull),
}

impl Message {
    pub(crate) fn kind(&self) -> MessageType {
        match self {
            Message::Ping(_) => MessageType::Ping,
            Message::IndirectPing(_) => MessageType::IndirectPing,
            Message::Ack(_) => MessageType::Ack,
            Message::Suspect(_) => MessageType::Suspect,
            Message::Alive(_) => MessageType::Alive,
            Message::Dead(_) => MessageType::Dead,
            Message::PushPull(_) => MessageType::PushPull,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    PushPull = 6,
    Compound = 7,
}

impl MessageType {
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Ping),
            1 => Ok(MessageType::IndirectPing),
            2 => Ok(MessageType::Ack),
            3 => Ok(MessageType::Suspect),
            4 => Ok(MessageType::Alive),
            5 => Ok(MessageType::Dead),
            6 => Ok(MessageType::PushPull),
            7 => Ok(MessageType::Compound),
            _ => Err(anyhow!("invalid message type: {}", value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Ping => "ping",
            MessageType::IndirectPing => "indirect-ping",
            MessageType::Ack => "ack",
            MessageType::Suspect => "suspect",
            MessageType::Alive => "alive",
            MessageType::Dead => "dead",
            MessageType::PushPull => "push-pull",
            MessageType::Compound => "compound",
        };
        write!(f, "{}", name)
    }
}
