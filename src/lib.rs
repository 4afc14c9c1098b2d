use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Context as _, Result};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::bytes::{Buf, BytesMut};
use tracing::{debug, error, info, warn};

use crate::ack::AckRegistry;
use crate::codec::{
    decode_message, encode_message, make_compound_message, read_push_pull, split_compound_message,
    write_push_pull, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD, MAX_UDP_PACKET_SIZE,
};
use crate::listener::MurmurListener;
use crate::members::NodeTable;
use crate::message::{Ack, Alive, Dead, IndirectPingReq, Message, MessageType, Ping, Suspect};
use crate::utils::pretty_debug;

pub use crate::broadcast_queue::{BroadcastQueue, DefaultBroadcastQueue};
pub use crate::config::{MurmurConfig, MurmurConfigBuilder};
pub use crate::ip_addr::IpAddress;
pub use crate::message::PushNodeState;
pub use crate::node::{DefaultMetadata, Node, NodeMetadata};
pub use crate::notify::Notifier;
pub use crate::state::State;
pub use crate::transport::{DefaultTransport, NodeTransport, TransportChannel};

mod ack;
mod broadcast_queue;
mod codec;
pub mod config;
mod ip_addr;
mod listener;
mod members;
mod message;
#[cfg(test)]
mod mock_transport;
mod node;
mod notify;
mod state;
mod transport;
mod utils;

use crate::node::NodeState;

/// SWIM-style cluster membership and failure detection.
///
/// Every node keeps a local view of which peers are alive, suspected or
/// dead and spreads changes epidemically. Three periodic activities drive
/// the protocol:
///
/// * Probing: one peer per round gets a direct ping; on silence, a handful
///   of relays ping it on our behalf, and a peer that stays silent on every
///   path becomes suspect.
/// * Gossip: queued membership updates are packed into compound datagrams
///   and sent to a few random peers.
/// * Push/pull: a full state exchange with one random peer keeps views from
///   drifting apart when gossip loses packets.
///
/// Conflicting reports are settled by per-node incarnation numbers: only a
/// node itself ever raises its own incarnation, which is how it refutes
/// stale suspicion about itself.
pub struct Murmur<M = DefaultMetadata>
where
    M: NodeMetadata,
{
    inner: Arc<InnerMurmur<M>>,
}

enum MurmurState {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct InnerMurmur<M>
where
    M: NodeMetadata,
{
    /// The local node metadata.
    metadata: M,

    config: MurmurConfig,

    /// Local view of every known peer, both name-indexed and ordered for
    /// round-robin probing. One lock covers both views.
    members: RwLock<NodeTable<M>>,

    transport: Arc<dyn NodeTransport>,

    /// Inbound side of the transport, consumed when the listener starts.
    listener_channel: Mutex<Option<TransportChannel>>,

    /// Outbound membership updates awaiting gossip.
    broadcasts: Arc<dyn BroadcastQueue>,

    /// Pending ack waiters keyed by probe sequence number.
    acks: Arc<AckRegistry>,

    notifier: Notifier<M>,

    state: RwLock<MurmurState>,

    shutdown: broadcast::Sender<()>,

    /// Handles of the periodic drivers and the listener, awaited on stop.
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,

    /// Correlates probes with their acks.
    sequence_number: AtomicU32,

    /// Our own incarnation number. Only we ever increment it.
    incarnation: AtomicU32,

    /// Set once the node voluntarily leaves, so a dead report about
    /// ourselves is no longer refuted.
    leaving: AtomicBool,
}

impl<M> Clone for Murmur<M>
where
    M: NodeMetadata,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Murmur {
    /// Creates a node with empty metadata on the default transport and
    /// broadcast queue.
    pub async fn new(config: MurmurConfig) -> Result<Self> {
        Self::with_notifier(config, Notifier::none()).await
    }

    /// As [`Murmur::new`], delivering join/leave events to the given
    /// notification channels.
    pub async fn with_notifier(config: MurmurConfig, notifier: Notifier) -> Result<Self> {
        let queue = DefaultBroadcastQueue::new(config.initial_cluster_size);
        let (transport, channel) = DefaultTransport::new(config.ip_addr(), config.port()).await?;
        Self::with_custom(
            config,
            DefaultMetadata,
            Arc::new(queue),
            Arc::new(transport),
            channel,
            notifier,
        )
    }
}

impl<M> Murmur<M>
where
    M: NodeMetadata,
{
    /// Creates a node from caller-supplied metadata, broadcast queue and
    /// transport.
    pub fn with_custom(
        config: MurmurConfig,
        metadata: M,
        broadcasts: Arc<dyn BroadcastQueue>,
        transport: Arc<dyn NodeTransport>,
        channel: TransportChannel,
        notifier: Notifier<M>,
    ) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(InnerMurmur {
                metadata,
                config,
                members: RwLock::new(NodeTable::new()),
                transport,
                listener_channel: Mutex::new(Some(channel)),
                broadcasts,
                acks: AckRegistry::new(),
                notifier,
                state: RwLock::new(MurmurState::Idle),
                shutdown: shutdown_tx,
                tasks: tokio::sync::Mutex::new(Vec::new()),
                sequence_number: AtomicU32::new(0),
                incarnation: AtomicU32::new(0),
                leaving: AtomicBool::new(false),
            }),
        })
    }

    /// Registers ourselves as alive and arms the periodic drivers. A zero
    /// interval disables the corresponding activity.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            if matches!(*state, MurmurState::Running) {
                return Err(anyhow!("murmur is already running"));
            }
            *state = MurmurState::Running;
        }
        self.inner.leaving.store(false, Ordering::SeqCst);

        self.set_local_node_liveness()?;

        let channel = self
            .inner
            .listener_channel
            .lock()
            .take()
            .ok_or_else(|| anyhow!("transport channel already consumed"))?;

        info!(name = %self.inner.config.name(), addr = %self.local_addr(), "murmur node started");

        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(self.spawn_listener(channel));
        if !self.inner.config.probe_interval.is_zero() {
            tasks.push(self.spawn_probe_loop());
        }
        if !self.inner.config.gossip_interval.is_zero() && self.inner.config.gossip_nodes > 0 {
            tasks.push(self.spawn_gossip_loop());
        }
        if !self.inner.config.push_pull_interval.is_zero() {
            tasks.push(self.spawn_push_pull_loop());
        }
        Ok(())
    }

    /// Cancels the periodic drivers and waits for in-flight handlers to
    /// finish. Outstanding ack waiters are dropped; probes already on the
    /// wire complete harmlessly against the stopped state.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                MurmurState::Running => *state = MurmurState::Stopped,
                MurmurState::Idle => return Err(anyhow!("murmur is not running")),
                MurmurState::Stopped => return Ok(()),
            }
        }

        let _ = self.inner.shutdown.send(());
        self.inner.acks.clear();

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.inner.transport.shutdown().await?;

        info!(name = %self.inner.config.name(), "murmur node stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.read(), MurmurState::Running)
    }

    /// Joins an existing cluster by exchanging full state with a seed node.
    pub async fn join(&self, seed_addr: SocketAddr) -> Result<()> {
        debug!(%seed_addr, "joining cluster via seed");
        let local = self.inner.members.read().push_states()?;
        let remote = self
            .inner
            .transport
            .send_and_receive_state(seed_addr, local)
            .await
            .context("failed to exchange state with seed")?;
        self.merge_state(remote);
        Ok(())
    }

    /// Announces a voluntary departure. The dead report about ourselves is
    /// queued for gossip instead of being refuted.
    pub fn leave(&self) {
        self.inner.leaving.store(true, Ordering::SeqCst);
        let dead = Dead {
            incarnation: self.incarnation(),
            node: self.inner.config.name().to_string(),
        };
        self.dead_node(dead);
    }

    /// Every known peer, including suspects and the recently dead.
    pub fn members(&self) -> Vec<Node<M>> {
        self.inner
            .members
            .read()
            .snapshot()
            .into_iter()
            .map(|state| state.node)
            .collect()
    }

    pub fn local_node(&self) -> Result<Node<M>> {
        self.inner
            .members
            .read()
            .get(self.inner.config.name())
            .map(|state| state.node.clone())
            .ok_or_else(|| anyhow!("local node is not registered"))
    }

    fn spawn_listener(&self, channel: TransportChannel) -> JoinHandle<()> {
        let listener = MurmurListener::new(self.clone(), channel);
        let shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(listener.run(shutdown_rx))
    }

    fn spawn_probe_loop(&self) -> JoinHandle<()> {
        let murmur = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let period = self.inner.config.probe_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = murmur.probe().await {
                            error!("probe round failed: {}", e);
                        }
                        debug!("{}", pretty_debug("membership:", &murmur.inner.members.read().snapshot()));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_gossip_loop(&self) -> JoinHandle<()> {
        let murmur = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let period = self.inner.config.gossip_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = murmur.gossip().await {
                            error!("gossip round failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_push_pull_loop(&self) -> JoinHandle<()> {
        let murmur = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let period = self.inner.config.push_pull_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = murmur.push_pull().await {
                            error!("state exchange round failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn next_seq_no(&self) -> u32 {
        self.inner
            .sequence_number
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1)
    }

    fn next_incarnation(&self) -> u32 {
        self.inner
            .incarnation
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1)
    }

    fn incarnation(&self) -> u32 {
        self.inner.incarnation.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner
            .transport
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(self.inner.config.ip_addr(), self.inner.config.port()))
    }

    /// Feeds our own record through the alive path so the local node shows
    /// up in the table and the join is gossiped like any other.
    fn set_local_node_liveness(&self) -> Result<()> {
        let alive = Alive {
            incarnation: self.next_incarnation(),
            node: self.inner.config.name().to_string(),
            addr: self.local_addr(),
            meta: self.inner.metadata.to_bytes()?,
        };
        self.alive_node(alive);
        Ok(())
    }

    /// One round of failure detection: pick the next probeable peer in
    /// round-robin order and check it.
    pub(crate) async fn probe(&self) -> Result<()> {
        let target = {
            let mut members = self.inner.members.write();
            members.next_probe_target(self.inner.config.name())
        };

        match target {
            Some(node) => self.probe_node(&node).await,
            None => {
                debug!("no probeable peer this round");
                Ok(())
            }
        }
    }

    /// Checks a single peer: direct ping, then indirect pings through
    /// random relays, and finally a suspect verdict if every path stays
    /// silent.
    ///
    /// All acks funnel through one channel, so the first success wins no
    /// matter which path delivered it. The channel holds one slot per
    /// possible acker, keeping every send non-blocking. The registry's
    /// reap timer is armed before the first ping leaves, and the indirect
    /// wait relies on it as its only timeout.
    pub(crate) async fn probe_node(&self, target: &NodeState<M>) -> Result<()> {
        let seq_no = self.next_seq_no();
        let (ack_tx, mut ack_rx) = mpsc::channel(self.inner.config.indirect_checks + 1);
        self.inner
            .acks
            .set_ack_channel(seq_no, ack_tx, self.inner.config.probe_interval);

        debug!(node = %target.name(), seq_no, "probing");
        if let Err(e) = self
            .send_message(target.addr(), Message::Ping(Ping { seq_no }))
            .await
        {
            warn!(node = %target.name(), "failed to send ping: {}", e);
            return Ok(());
        }

        match time::timeout(self.inner.config.rtt, ack_rx.recv()).await {
            Ok(Some(true)) => return Ok(()),
            // Reaped early or silent; fall through to indirect probing.
            Ok(_) => {}
            Err(_) => {}
        }

        let relays = {
            let members = self.inner.members.read();
            members.k_random_nodes(
                self.inner.config.indirect_checks,
                &[self.inner.config.name(), target.name()],
            )
        };

        let indirect = IndirectPingReq {
            seq_no,
            target: target.addr(),
        };
        for relay in &relays {
            if let Err(e) = self
                .send_message(relay.addr, Message::IndirectPing(indirect.clone()))
                .await
            {
                warn!(relay = %relay.name, "failed to send indirect ping: {}", e);
            }
        }

        // Bounded by the reap timer, which also closes the channel.
        if let Some(true) = ack_rx.recv().await {
            return Ok(());
        }

        warn!(node = %target.name(), "no ack on any path, marking suspect");
        self.suspect_node(Suspect {
            incarnation: target.incarnation,
            node: target.name().to_string(),
        });
        Ok(())
    }

    /// One round of gossip: drain queued updates into compound datagrams
    /// for a few random peers.
    pub(crate) async fn gossip(&self) -> Result<()> {
        let targets = {
            let members = self.inner.members.read();
            members.k_random_nodes(self.inner.config.gossip_nodes, &[self.inner.config.name()])
        };
        if targets.is_empty() {
            return Ok(());
        }

        let budget = MAX_UDP_PACKET_SIZE - COMPOUND_HEADER_OVERHEAD;
        for node in targets {
            let msgs = self.inner.broadcasts.get_broadcasts(COMPOUND_OVERHEAD, budget)?;
            if msgs.is_empty() {
                return Ok(());
            }

            let compound = make_compound_message(&msgs);
            if let Err(e) = self.inner.transport.send_to(node.addr, &compound).await {
                warn!(node = %node.name, "failed to send gossip: {}", e);
            }
        }
        Ok(())
    }

    /// One round of anti-entropy: full state exchange with a random peer.
    pub(crate) async fn push_pull(&self) -> Result<()> {
        let nodes = {
            let members = self.inner.members.read();
            members.k_random_nodes(1, &[self.inner.config.name()])
        };
        let Some(node) = nodes.into_iter().next() else {
            return Ok(());
        };

        self.push_pull_node(node.addr).await
    }

    /// Exchanges state with one peer. Best-effort: transport failures are
    /// logged and the next round tries someone else.
    pub(crate) async fn push_pull_node(&self, addr: SocketAddr) -> Result<()> {
        let local = self.inner.members.read().push_states()?;
        let remote = match self.inner.transport.send_and_receive_state(addr, local).await {
            Ok(remote) => remote,
            Err(e) => {
                debug!(%addr, "state exchange failed: {}", e);
                return Ok(());
            }
        };
        self.merge_state(remote);
        Ok(())
    }

    /// Applies a peer's full state vector through the regular alive,
    /// suspect and dead paths. Records whose state matches ours are
    /// skipped; the paths are idempotent, so this is purely an
    /// optimization.
    pub(crate) fn merge_state(&self, remote: Vec<PushNodeState>) {
        for record in remote {
            let agreed = {
                let members = self.inner.members.read();
                members
                    .get(&record.name)
                    .map_or(false, |local| local.state == record.state)
            };
            if agreed {
                continue;
            }

            match record.state {
                State::Alive => self.alive_node(Alive {
                    incarnation: record.incarnation,
                    node: record.name,
                    addr: record.addr,
                    meta: record.meta,
                }),
                State::Suspect => self.suspect_node(Suspect {
                    incarnation: record.incarnation,
                    node: record.name,
                }),
                State::Dead => self.dead_node(Dead {
                    incarnation: record.incarnation,
                    node: record.name,
                }),
            }
        }
    }

    /// Handles a report that a node is alive at some incarnation.
    ///
    /// A first mention creates the record in the dead state at incarnation
    /// zero, so the report itself decides whether the node comes up. Stale
    /// incarnations are dropped silently; an accepted report is re-gossiped
    /// before the new view becomes observable.
    pub(crate) fn alive_node(&self, a: Alive) {
        let mut members = self.inner.members.write();

        if !members.contains(&a.node) {
            let metadata = match M::from_bytes(&a.meta) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(node = %a.node, "discarding alive with undecodable metadata: {}", e);
                    return;
                }
            };
            let node = Node {
                name: a.node.clone(),
                addr: a.addr,
                metadata,
            };
            members.insert(NodeState::new(node, 0, State::Dead));
        }

        let Some(state) = members.get_mut(&a.node) else {
            return;
        };

        // An alive report must carry a strictly newer incarnation to
        // override anything, including an older alive.
        if a.incarnation <= state.incarnation {
            return;
        }

        self.encode_and_broadcast(&a.node, Message::Alive(a.clone()));

        let old_state = state.state;
        state.incarnation = a.incarnation;
        state.set_state(State::Alive);

        if old_state == State::Dead {
            info!(node = %a.node, incarnation = a.incarnation, "node joined");
            self.inner.notifier.notify_join(&state.node);
        }
    }

    /// Handles a rumor that a node is suspect.
    ///
    /// Suspicion only ever displaces the alive state; equal incarnations
    /// cannot re-suspect or displace a dead record. A rumor about
    /// ourselves is refuted with a fresh incarnation instead. An accepted
    /// rumor arms the suspicion timer bound to this exact state change.
    pub(crate) fn suspect_node(&self, s: Suspect) {
        let mut members = self.inner.members.write();
        let cluster_size = members.len();

        let Some(state) = members.get_mut(&s.node) else {
            return;
        };
        if s.incarnation < state.incarnation {
            return;
        }
        if state.state != State::Alive {
            return;
        }

        if s.node == self.inner.config.name() {
            self.refute(state);
            return; // never mark ourselves suspect
        }

        self.encode_and_broadcast(&s.node, Message::Suspect(s.clone()));

        state.incarnation = s.incarnation;
        state.set_state(State::Suspect);
        let change_time = state.state_change;
        warn!(node = %s.node, incarnation = s.incarnation, "node is now suspect");

        let timeout = self.inner.config.suspicion_timeout(cluster_size);
        let murmur = self.clone();
        let node_name = s.node.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(timeout) => murmur.suspect_timeout(&node_name, change_time),
                _ = shutdown_rx.recv() => {}
            }
        });
    }

    /// Fires when a suspicion timer expires. The captured change time
    /// makes this a no-op if anything happened to the record in between;
    /// no cancellation handle is needed.
    fn suspect_timeout(&self, node_name: &str, change_time: SystemTime) {
        let dead = {
            let members = self.inner.members.read();
            match members.get(node_name) {
                Some(state)
                    if state.state == State::Suspect && state.state_change == change_time =>
                {
                    Some(Dead {
                        incarnation: state.incarnation,
                        node: node_name.to_string(),
                    })
                }
                _ => None,
            }
        };

        if let Some(dead) = dead {
            info!(node = %dead.node, "suspicion timeout reached, marking dead");
            self.dead_node(dead);
        }
    }

    /// Handles a report that a node is dead. At equal incarnation a dead
    /// report displaces suspicion, and only a strictly newer alive can
    /// undo it. A report about ourselves is refuted unless we are leaving
    /// voluntarily.
    pub(crate) fn dead_node(&self, d: Dead) {
        let mut members = self.inner.members.write();

        let Some(state) = members.get_mut(&d.node) else {
            return;
        };
        if d.incarnation < state.incarnation {
            return;
        }
        if state.state == State::Dead {
            return;
        }

        if d.node == self.inner.config.name() && !self.inner.leaving.load(Ordering::SeqCst) {
            self.refute(state);
            return; // never mark ourselves dead
        }

        self.encode_and_broadcast(&d.node, Message::Dead(d.clone()));

        state.incarnation = d.incarnation;
        state.set_state(State::Dead);
        info!(node = %d.node, incarnation = d.incarnation, "node left");
        self.inner.notifier.notify_leave(&state.node);
    }

    /// Overrides a rumor about ourselves by gossiping an alive at a fresh
    /// incarnation. The caller keeps the record in its current state.
    fn refute(&self, state: &mut NodeState<M>) {
        let incarnation = self.next_incarnation();
        let meta = match state.node.metadata.to_bytes() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("failed to encode metadata while refuting: {}", e);
                Vec::new()
            }
        };

        let alive = Alive {
            incarnation,
            node: state.name().to_string(),
            addr: state.addr(),
            meta,
        };
        info!(incarnation, "refuting rumor about ourselves");
        self.encode_and_broadcast(state.name(), Message::Alive(alive));
        state.incarnation = incarnation;
    }

    /// Queues an accepted update for gossip, keyed by node name so newer
    /// updates about the same node supersede older ones.
    pub(crate) fn encode_and_broadcast(&self, key: &str, message: Message) {
        let kind = message.kind();
        match encode_message(&message) {
            Ok(buffer) => {
                if let Err(e) = self
                    .inner
                    .broadcasts
                    .queue_broadcast(key.to_string(), buffer.freeze())
                {
                    warn!("failed to queue {} broadcast for {}: {}", kind, key, e);
                }
            }
            Err(e) => warn!("failed to encode {} broadcast for {}: {}", kind, key, e),
        }
    }

    pub(crate) async fn send_message(&self, addr: SocketAddr, message: Message) -> Result<()> {
        let buffer = encode_message(&message)?;
        self.inner.transport.send_to(addr, &buffer).await
    }

    /// Decodes an inbound datagram, splitting compound messages, and
    /// routes each part. Malformed input is dropped without a reply.
    pub(crate) async fn handle_datagram(&self, from: SocketAddr, payload: Vec<u8>) {
        let mut buffer = BytesMut::from(&payload[..]);

        if buffer.first() == Some(&(MessageType::Compound as u8)) {
            buffer.advance(1);
            let parts = match split_compound_message(&mut buffer) {
                Ok(parts) => parts,
                Err(e) => {
                    debug!(%from, "discarding malformed compound datagram: {}", e);
                    return;
                }
            };
            for mut part in parts {
                match decode_message(&mut part) {
                    Ok(message) => self.dispatch_message(from, message).await,
                    Err(e) => debug!(%from, "discarding malformed compound part: {}", e),
                }
            }
        } else {
            match decode_message(&mut buffer) {
                Ok(message) => self.dispatch_message(from, message).await,
                Err(e) => debug!(%from, "discarding malformed datagram: {}", e),
            }
        }
    }

    async fn dispatch_message(&self, from: SocketAddr, message: Message) {
        match message {
            Message::Ping(ping) => {
                if let Err(e) = self.handle_ping(from, ping).await {
                    debug!(%from, "failed to answer ping: {}", e);
                }
            }
            Message::IndirectPing(request) => {
                if let Err(e) = self.handle_indirect_ping(from, request).await {
                    debug!(%from, "failed to relay ping: {}", e);
                }
            }
            Message::Ack(ack) => self.inner.acks.invoke_ack_handler(ack.seq_no),
            Message::Alive(alive) => self.alive_node(alive),
            Message::Suspect(suspect) => self.suspect_node(suspect),
            Message::Dead(dead) => self.dead_node(dead),
            Message::PushPull(_) => {
                debug!(%from, "discarding state exchange sent as datagram")
            }
        }
    }

    async fn handle_ping(&self, from: SocketAddr, ping: Ping) -> Result<()> {
        debug!(%from, seq_no = ping.seq_no, "answering ping");
        self.send_message(from, Message::Ack(Ack { seq_no: ping.seq_no }))
            .await
    }

    /// Probes the target on behalf of `from`. The relayed ping gets its
    /// own sequence number; when its ack arrives, an ack under the
    /// original sequence number is forwarded to the requester.
    async fn handle_indirect_ping(&self, from: SocketAddr, request: IndirectPingReq) -> Result<()> {
        let relay_seq_no = self.next_seq_no();
        debug!(%from, target = %request.target, relay_seq_no, "relaying ping");

        let murmur = self.clone();
        let origin_seq_no = request.seq_no;
        let timeout = self.inner.config.probe_interval.max(self.inner.config.rtt);
        self.inner.acks.set_ack_handler(
            relay_seq_no,
            move || {
                tokio::spawn(async move {
                    let ack = Message::Ack(Ack {
                        seq_no: origin_seq_no,
                    });
                    if let Err(e) = murmur.send_message(from, ack).await {
                        warn!(%from, "failed to forward relayed ack: {}", e);
                    }
                });
            },
            timeout,
        );

        self.send_message(
            request.target,
            Message::Ping(Ping {
                seq_no: relay_seq_no,
            }),
        )
        .await
    }

    /// Serves the passive side of a state exchange: read the peer's
    /// records, answer with ours, then merge theirs.
    pub(crate) async fn handle_push_pull_stream<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let remote = read_push_pull(&mut stream).await?;
        let local = self.inner.members.read().push_states()?;
        write_push_pull(&mut stream, local).await?;
        self.merge_state(remote);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::{remote_state, test_addr, test_record, MockTransport};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::sleep;

    const LOCAL: &str = "local";
    const LOCAL_PORT: u16 = 5870;

    struct Harness {
        murmur: Murmur,
        transport: Arc<MockTransport>,
        join_rx: Receiver<Node>,
        leave_rx: Receiver<Node>,
    }

    fn harness_with(config: MurmurConfig) -> Harness {
        let (transport, channel) = MockTransport::new(test_addr(LOCAL_PORT));
        let (join_tx, join_rx) = mpsc::channel(16);
        let (leave_tx, leave_rx) = mpsc::channel(16);

        let mock: Arc<dyn NodeTransport> = transport.clone();
        let murmur = Murmur::with_custom(
            config,
            DefaultMetadata,
            Arc::new(DefaultBroadcastQueue::new(8)),
            mock,
            channel,
            Notifier::new(Some(join_tx), Some(leave_tx)),
        )
        .unwrap();

        Harness {
            murmur,
            transport,
            join_rx,
            leave_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(300, 50))
    }

    fn test_config(probe_ms: u64, rtt_ms: u64) -> MurmurConfig {
        MurmurConfigBuilder::new()
            .with_name(LOCAL)
            .with_port(LOCAL_PORT)
            .with_probe_interval(Duration::from_millis(probe_ms))
            .with_rtt(Duration::from_millis(rtt_ms))
            .with_suspicion_mult(2)
            .build()
            .unwrap()
    }

    fn alive(name: &str, port: u16, incarnation: u32) -> Alive {
        Alive {
            incarnation,
            node: name.to_string(),
            addr: test_addr(port),
            meta: vec![],
        }
    }

    impl Harness {
        fn peer_state(&self, name: &str) -> Option<(State, u32)> {
            self.murmur
                .inner
                .members
                .read()
                .get(name)
                .map(|s| (s.state, s.incarnation))
        }

        /// Drains and decodes everything currently queued for gossip.
        fn drain_broadcasts(&self) -> Vec<Message> {
            self.murmur
                .inner
                .broadcasts
                .get_broadcasts(0, usize::MAX / 2)
                .unwrap()
                .into_iter()
                .filter_map(|bytes| decode_message(&mut BytesMut::from(&bytes[..])).ok())
                .collect()
        }

        fn clear_broadcasts(&self) {
            while !self.drain_broadcasts().is_empty() {}
        }

        /// Polls the mock transport until a message matching `pick` shows
        /// up, or panics after a second.
        async fn wait_for_message<T>(
            &self,
            pick: impl Fn(&SocketAddr, &Message) -> Option<T>,
        ) -> T {
            for _ in 0..200 {
                for (addr, message) in self.transport.sent_messages() {
                    if let Some(found) = pick(&addr, &message) {
                        return found;
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
            panic!("expected message never sent");
        }
    }

    #[tokio::test]
    async fn test_alive_unknown_node_joins() {
        let mut h = harness();

        h.murmur.alive_node(alive("peer", 9001, 1));

        assert_eq!(h.peer_state("peer"), Some((State::Alive, 1)));
        assert_eq!(h.join_rx.try_recv().unwrap().name, "peer");

        let broadcasts = h.drain_broadcasts();
        assert!(matches!(broadcasts.as_slice(), [Message::Alive(a)] if a.node == "peer"));
    }

    #[tokio::test]
    async fn test_alive_requires_strictly_newer_incarnation() {
        let h = harness();
        h.murmur.alive_node(alive("peer", 9001, 2));
        h.clear_broadcasts();

        // Replay and an older report are both dropped.
        h.murmur.alive_node(alive("peer", 9001, 2));
        h.murmur.alive_node(alive("peer", 9001, 1));

        assert_eq!(h.peer_state("peer"), Some((State::Alive, 2)));
        assert!(h.drain_broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_suspect_unknown_node_discarded() {
        let h = harness();
        h.murmur.suspect_node(Suspect {
            incarnation: 1,
            node: "ghost".to_string(),
        });

        assert!(h.peer_state("ghost").is_none());
        assert!(h.drain_broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_dead_overrides_suspect_and_alive_tie_break() {
        let mut h = harness();
        h.murmur.alive_node(alive("peer", 9001, 7));
        h.clear_broadcasts();

        // Dead wins at equal incarnation.
        h.murmur.dead_node(Dead {
            incarnation: 7,
            node: "peer".to_string(),
        });
        assert_eq!(h.peer_state("peer"), Some((State::Dead, 7)));
        assert_eq!(h.leave_rx.try_recv().unwrap().name, "peer");
        let broadcasts = h.drain_broadcasts();
        assert!(matches!(broadcasts.as_slice(), [Message::Dead(d)] if d.incarnation == 7));

        // An alive at the same incarnation cannot resurrect it.
        h.murmur.alive_node(alive("peer", 9001, 7));
        assert_eq!(h.peer_state("peer"), Some((State::Dead, 7)));

        // A strictly newer one can.
        h.murmur.alive_node(alive("peer", 9001, 8));
        assert_eq!(h.peer_state("peer"), Some((State::Alive, 8)));
        assert_eq!(h.join_rx.try_recv().unwrap().name, "peer");
    }

    #[tokio::test]
    async fn test_suspect_cannot_displace_suspect_or_dead() {
        let h = harness();
        h.murmur.alive_node(alive("peer", 9001, 3));
        h.murmur.suspect_node(Suspect {
            incarnation: 3,
            node: "peer".to_string(),
        });
        h.clear_broadcasts();

        // Re-suspecting an already suspect node changes nothing.
        h.murmur.suspect_node(Suspect {
            incarnation: 3,
            node: "peer".to_string(),
        });
        assert_eq!(h.peer_state("peer"), Some((State::Suspect, 3)));
        assert!(h.drain_broadcasts().is_empty());

        h.murmur.dead_node(Dead {
            incarnation: 3,
            node: "peer".to_string(),
        });
        h.clear_broadcasts();
        h.murmur.suspect_node(Suspect {
            incarnation: 3,
            node: "peer".to_string(),
        });
        assert_eq!(h.peer_state("peer"), Some((State::Dead, 3)));
        assert!(h.drain_broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_suspect_about_self_is_refuted() {
        let h = harness();
        h.murmur.set_local_node_liveness().unwrap();
        h.clear_broadcasts();
        assert_eq!(h.peer_state(LOCAL), Some((State::Alive, 1)));

        h.murmur.suspect_node(Suspect {
            incarnation: 1,
            node: LOCAL.to_string(),
        });

        // Still alive, one incarnation up, refutation queued.
        assert_eq!(h.peer_state(LOCAL), Some((State::Alive, 2)));
        let broadcasts = h.drain_broadcasts();
        match broadcasts.as_slice() {
            [Message::Alive(a)] => {
                assert_eq!(a.node, LOCAL);
                assert_eq!(a.incarnation, 2);
            }
            other => panic!("expected a refutation, got {} messages", other.len()),
        }
    }

    #[tokio::test]
    async fn test_dead_about_self_refuted_unless_leaving() {
        let mut h = harness();
        h.murmur.set_local_node_liveness().unwrap();
        h.clear_broadcasts();

        h.murmur.dead_node(Dead {
            incarnation: 1,
            node: LOCAL.to_string(),
        });
        assert_eq!(h.peer_state(LOCAL), Some((State::Alive, 2)));
        assert!(h.leave_rx.try_recv().is_err());
        h.clear_broadcasts();

        // After a voluntary leave the same report is accepted.
        h.murmur.leave();
        assert_eq!(h.peer_state(LOCAL), Some((State::Dead, 2)));
        assert_eq!(h.leave_rx.try_recv().unwrap().name, LOCAL);
        let broadcasts = h.drain_broadcasts();
        assert!(matches!(broadcasts.as_slice(), [Message::Dead(d)] if d.node == LOCAL));
    }

    #[tokio::test]
    async fn test_suspicion_timeout_promotes_to_dead() {
        let mut h = harness_with(test_config(100, 20));
        for i in 0..3 {
            h.murmur.alive_node(alive(&format!("peer-{}", i), 9001 + i as u16, 1));
        }
        h.clear_broadcasts();

        h.murmur.suspect_node(Suspect {
            incarnation: 1,
            node: "peer-0".to_string(),
        });
        assert_eq!(h.peer_state("peer-0"), Some((State::Suspect, 1)));

        // suspicion_mult(2) * log10(3) * 100ms is roughly 95ms.
        sleep(Duration::from_millis(400)).await;
        assert_eq!(h.peer_state("peer-0"), Some((State::Dead, 1)));
        assert_eq!(h.leave_rx.recv().await.unwrap().name, "peer-0");
    }

    #[tokio::test]
    async fn test_refutation_disarms_suspicion_timer() {
        let h = harness_with(test_config(100, 20));
        for i in 0..3 {
            h.murmur.alive_node(alive(&format!("peer-{}", i), 9001 + i as u16, 1));
        }

        h.murmur.suspect_node(Suspect {
            incarnation: 1,
            node: "peer-0".to_string(),
        });
        // The peer refutes with a newer incarnation before the timer fires.
        h.murmur.alive_node(alive("peer-0", 9001, 2));

        sleep(Duration::from_millis(400)).await;
        assert_eq!(h.peer_state("peer-0"), Some((State::Alive, 2)));
    }

    #[tokio::test]
    async fn test_merge_state_is_idempotent() {
        let h = harness();
        let remote = vec![
            remote_state("peer-a", 9001, 1, State::Alive),
            remote_state("peer-b", 9002, 4, State::Alive),
        ];

        h.murmur.merge_state(remote.clone());
        assert_eq!(h.peer_state("peer-a"), Some((State::Alive, 1)));
        assert_eq!(h.peer_state("peer-b"), Some((State::Alive, 4)));
        assert!(!h.drain_broadcasts().is_empty());
        h.clear_broadcasts();

        // A converged view produces no further gossip.
        h.murmur.merge_state(remote);
        assert!(h.drain_broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_probe_direct_ack_succeeds() {
        let h = harness();
        let target = test_record("peer", 9001, 1, State::Alive);
        h.murmur.alive_node(alive("peer", 9001, 1));
        h.clear_broadcasts();

        let murmur = h.murmur.clone();
        let probe = tokio::spawn(async move { murmur.probe_node(&target).await });

        let seq_no = h
            .wait_for_message(|addr, message| match message {
                Message::Ping(ping) if *addr == test_addr(9001) => Some(ping.seq_no),
                _ => None,
            })
            .await;
        h.murmur.inner.acks.invoke_ack_handler(seq_no);

        probe.await.unwrap().unwrap();
        assert_eq!(h.peer_state("peer"), Some((State::Alive, 1)));
        assert!(h.drain_broadcasts().is_empty(), "no suspicion expected");
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_indirect() {
        let h = harness();
        let target = test_record("peer", 9001, 1, State::Alive);
        h.murmur.alive_node(alive("peer", 9001, 1));
        for i in 0..3 {
            h.murmur.alive_node(alive(&format!("relay-{}", i), 9100 + i as u16, 1));
        }
        h.clear_broadcasts();

        let murmur = h.murmur.clone();
        let probe = tokio::spawn(async move { murmur.probe_node(&target).await });

        // After the direct window, relays get the request with the same
        // sequence number and the target's address.
        let (seq_no, relay_addr) = h
            .wait_for_message(|addr, message| match message {
                Message::IndirectPing(request) => Some((request.seq_no, *addr)),
                _ => None,
            })
            .await;
        assert_ne!(relay_addr, test_addr(9001));
        assert_ne!(relay_addr, test_addr(LOCAL_PORT));

        let relayed_targets: Vec<SocketAddr> = h
            .transport
            .sent_messages()
            .iter()
            .filter_map(|(_, message)| match message {
                Message::IndirectPing(request) => Some(request.target),
                _ => None,
            })
            .collect();
        assert_eq!(relayed_targets.len(), 3);
        assert!(relayed_targets.iter().all(|addr| *addr == test_addr(9001)));

        h.murmur.inner.acks.invoke_ack_handler(seq_no);
        probe.await.unwrap().unwrap();

        assert_eq!(h.peer_state("peer"), Some((State::Alive, 1)));
        assert!(h.drain_broadcasts().is_empty(), "no suspicion expected");
    }

    #[tokio::test]
    async fn test_probe_without_acks_suspects_target() {
        let h = harness_with(test_config(150, 30));
        let target = test_record("peer", 9001, 1, State::Alive);
        h.murmur.alive_node(alive("peer", 9001, 1));
        h.murmur.alive_node(alive("relay", 9100, 1));
        h.clear_broadcasts();

        h.murmur.probe_node(&target).await.unwrap();

        assert_eq!(h.peer_state("peer"), Some((State::Suspect, 1)));
        let broadcasts = h.drain_broadcasts();
        assert!(matches!(broadcasts.as_slice(), [Message::Suspect(s)] if s.node == "peer"));
    }

    #[tokio::test]
    async fn test_handle_indirect_ping_relays_and_forwards_ack() {
        let h = harness();
        let origin = test_addr(9050);
        let target = test_addr(9001);

        h.murmur
            .handle_indirect_ping(
                origin,
                IndirectPingReq {
                    seq_no: 99,
                    target,
                },
            )
            .await
            .unwrap();

        let relay_seq_no = h
            .wait_for_message(|addr, message| match message {
                Message::Ping(ping) if *addr == target => Some(ping.seq_no),
                _ => None,
            })
            .await;
        assert_ne!(relay_seq_no, 99, "relayed ping uses its own sequence number");

        // The target's ack comes back under our relay sequence number and
        // is forwarded to the origin under the original one.
        h.murmur.inner.acks.invoke_ack_handler(relay_seq_no);
        let forwarded = h
            .wait_for_message(|addr, message| match message {
                Message::Ack(ack) if *addr == origin => Some(ack.seq_no),
                _ => None,
            })
            .await;
        assert_eq!(forwarded, 99);
    }

    #[tokio::test]
    async fn test_handle_ping_answers_with_ack() {
        let h = harness();
        let from = test_addr(9001);

        let buffer = encode_message(&Message::Ping(Ping { seq_no: 7 })).unwrap();
        h.murmur.handle_datagram(from, buffer.to_vec()).await;

        let seq_no = h
            .wait_for_message(|addr, message| match message {
                Message::Ack(ack) if *addr == from => Some(ack.seq_no),
                _ => None,
            })
            .await;
        assert_eq!(seq_no, 7);
    }

    #[tokio::test]
    async fn test_handle_datagram_ignores_malformed_input() {
        let h = harness();
        h.murmur.handle_datagram(test_addr(9001), vec![0xff, 1, 2]).await;
        h.murmur.handle_datagram(test_addr(9001), Vec::new()).await;
        assert!(h.transport.sent_datagrams().is_empty());
    }

    #[tokio::test]
    async fn test_gossip_packs_compound_for_random_peers() {
        let h = harness();
        h.murmur.alive_node(alive("peer-a", 9001, 1));
        h.murmur.alive_node(alive("peer-b", 9002, 1));

        h.murmur.gossip().await.unwrap();

        let datagrams = h.transport.sent_datagrams();
        assert_eq!(datagrams.len(), 2, "one compound per selected peer");
        for (addr, payload) in &datagrams {
            assert_ne!(*addr, test_addr(LOCAL_PORT));
            assert_eq!(payload[0], MessageType::Compound as u8);
        }
    }

    #[tokio::test]
    async fn test_gossip_with_empty_queue_sends_nothing() {
        let h = harness();
        h.murmur.alive_node(alive("peer", 9001, 1));
        h.clear_broadcasts();
        h.transport.clear_datagrams();

        h.murmur.gossip().await.unwrap();
        assert!(h.transport.sent_datagrams().is_empty());
    }

    #[tokio::test]
    async fn test_push_pull_merges_remote_state() {
        let h = harness();
        h.murmur.alive_node(alive("peer", 9001, 1));
        h.transport.push_exchange_result(Ok(vec![remote_state(
            "stranger",
            9200,
            5,
            State::Alive,
        )]));

        h.murmur.push_pull().await.unwrap();

        let requests = h.transport.exchange_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, test_addr(9001));
        assert!(requests[0].1.iter().any(|s| s.name == "peer"));
        assert_eq!(h.peer_state("stranger"), Some((State::Alive, 5)));
    }

    #[tokio::test]
    async fn test_push_pull_swallows_transport_errors() {
        let h = harness();
        h.murmur.alive_node(alive("peer", 9001, 1));
        h.transport
            .push_exchange_result(Err(anyhow!("connection refused")));

        h.murmur.push_pull().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_pull_stream_serves_local_state() {
        let h = harness();
        h.murmur.set_local_node_liveness().unwrap();

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let murmur = h.murmur.clone();
        let serve = tokio::spawn(async move { murmur.handle_push_pull_stream(server).await });

        write_push_pull(
            &mut client,
            vec![remote_state("remote", 9300, 2, State::Alive)],
        )
        .await
        .unwrap();
        let reply = read_push_pull(&mut client).await.unwrap();

        serve.await.unwrap().unwrap();
        assert!(reply.iter().any(|s| s.name == LOCAL));
        assert_eq!(h.peer_state("remote"), Some((State::Alive, 2)));
    }

    #[tokio::test]
    async fn test_join_surfaces_seed_errors() {
        let h = harness();
        h.transport
            .push_exchange_result(Err(anyhow!("connection refused")));

        assert!(h.murmur.join(test_addr(9400)).await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let h = harness_with(test_config(50, 10));

        h.murmur.start().await.unwrap();
        assert!(h.murmur.is_running());
        assert_eq!(h.murmur.local_node().unwrap().name, LOCAL);

        sleep(Duration::from_millis(120)).await;
        h.murmur.stop().await.unwrap();
        assert!(!h.murmur.is_running());

        // Stopping again is a no-op.
        h.murmur.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_intervals_disable_activities() {
        let config = MurmurConfigBuilder::new()
            .with_name(LOCAL)
            .with_probe_interval(Duration::ZERO)
            .with_gossip_interval(Duration::ZERO)
            .with_push_pull_interval(Duration::ZERO)
            .build()
            .unwrap();
        let h = harness_with(config);

        h.murmur.start().await.unwrap();
        assert_eq!(h.murmur.inner.tasks.lock().await.len(), 1, "listener only");
        h.murmur.stop().await.unwrap();
    }
}
