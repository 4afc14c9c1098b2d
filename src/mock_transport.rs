use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::bytes::BytesMut;

use crate::codec::decode_message;
use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;
use crate::message::{Message, PushNodeState};
use crate::node::{DefaultMetadata, Node, NodeState};
use crate::state::State;
use crate::transport::{NodeTransport, TransportChannel};

/// Transport double that records every send and replays scripted state
/// exchanges.
pub(crate) struct MockTransport {
    local_addr: SocketAddr,
    datagrams: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    exchange_requests: Mutex<Vec<(SocketAddr, Vec<PushNodeState>)>>,
    exchange_results: Mutex<VecDeque<Result<Vec<PushNodeState>>>>,
}

impl MockTransport {
    pub(crate) fn new(local_addr: SocketAddr) -> (Arc<Self>, TransportChannel) {
        let (_packet_tx, packet_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (_stream_tx, stream_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);

        (
            Arc::new(Self {
                local_addr,
                datagrams: Mutex::new(Vec::new()),
                exchange_requests: Mutex::new(Vec::new()),
                exchange_results: Mutex::new(VecDeque::new()),
            }),
            TransportChannel {
                packet_rx,
                stream_rx,
            },
        )
    }

    pub(crate) fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.datagrams.lock().clone()
    }

    /// Every successfully decoded message sent so far, with destinations.
    pub(crate) fn sent_messages(&self) -> Vec<(SocketAddr, Message)> {
        self.sent_datagrams()
            .into_iter()
            .filter_map(|(addr, payload)| {
                decode_message(&mut BytesMut::from(&payload[..]))
                    .ok()
                    .map(|msg| (addr, msg))
            })
            .collect()
    }

    pub(crate) fn clear_datagrams(&self) {
        self.datagrams.lock().clear();
    }

    pub(crate) fn push_exchange_result(&self, result: Result<Vec<PushNodeState>>) {
        self.exchange_results.lock().push_back(result);
    }

    pub(crate) fn exchange_requests(&self) -> Vec<(SocketAddr, Vec<PushNodeState>)> {
        self.exchange_requests.lock().clone()
    }
}

#[async_trait]
impl NodeTransport for MockTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        self.datagrams.lock().push((addr, payload.to_vec()));
        Ok(())
    }

    async fn send_and_receive_state(
        &self,
        addr: SocketAddr,
        local: Vec<PushNodeState>,
    ) -> Result<Vec<PushNodeState>> {
        self.exchange_requests.lock().push((addr, local));
        self.exchange_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted exchange result")))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

pub(crate) fn remote_state(name: &str, port: u16, incarnation: u32, state: State) -> PushNodeState {
    PushNodeState {
        name: name.to_string(),
        addr: test_addr(port),
        meta: vec![],
        incarnation,
        state,
    }
}

pub(crate) fn test_record(name: &str, port: u16, incarnation: u32, state: State) -> NodeState<DefaultMetadata> {
    NodeState::new(
        Node {
            name: name.to_string(),
            addr: test_addr(port),
            metadata: DefaultMetadata,
        },
        incarnation,
        state,
    )
}
