use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::Result;
use gethostname::gethostname;

use crate::ip_addr::IpAddress;

// Default configuration constants
pub(crate) const DEFAULT_PORT: u16 = 5870;
pub(crate) const DEFAULT_PROBE_INTERVAL: u64 = 1_000; // milliseconds
pub(crate) const DEFAULT_RTT: u64 = 100; // milliseconds
pub(crate) const DEFAULT_GOSSIP_INTERVAL: u64 = 200; // milliseconds
pub(crate) const DEFAULT_PUSH_PULL_INTERVAL: u64 = 30_000; // milliseconds
pub(crate) const DEFAULT_INDIRECT_CHECKS: usize = 3;
pub(crate) const DEFAULT_GOSSIP_NODES: usize = 3;
pub(crate) const DEFAULT_SUSPICION_MULT: u32 = 5;
pub(crate) const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1_000;

/// [`MurmurConfig`] holds the tunables of the membership protocol.
pub struct MurmurConfig {
    /// Name of the node, unique across the cluster.
    pub(crate) name: String,

    /// IP address the node binds to.
    pub(crate) ip_addr: IpAddr,

    /// Port for both the datagram socket and the state exchange listener.
    pub(crate) port: u16,

    /// How often a failure detection round runs. Zero disables probing.
    pub(crate) probe_interval: Duration,

    /// Expected round trip to a peer; the direct ping wait before falling
    /// back to indirect probing.
    pub(crate) rtt: Duration,

    /// How many peers relay an indirect probe on our behalf.
    pub(crate) indirect_checks: usize,

    /// How often queued updates are gossiped. Zero disables gossip.
    pub(crate) gossip_interval: Duration,

    /// Fan-out of each gossip round.
    pub(crate) gossip_nodes: usize,

    /// How often a full state exchange runs. Zero disables anti-entropy.
    pub(crate) push_pull_interval: Duration,

    /// Scales how long a suspect may linger before being declared dead.
    pub(crate) suspicion_mult: u32,

    /// Expected cluster size, used to seed retransmit limits before the
    /// table has filled up.
    pub(crate) initial_cluster_size: usize,
}

impl MurmurConfig {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_addr(&self) -> IpAddr {
        self.ip_addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// How long a node may stay suspect before the timer declares it dead.
    ///
    /// Scales with the logarithm of the cluster size: in a larger cluster
    /// the rumor needs more hops to reach the suspect, so it gets more time
    /// to refute.
    pub(crate) fn suspicion_timeout(&self, cluster_size: usize) -> Duration {
        let node_scale = (cluster_size.max(1) as f64).log10();
        self.probe_interval
            .mul_f64(self.suspicion_mult as f64 * node_scale)
    }
}

impl Clone for MurmurConfig {
    fn clone(&self) -> Self {
        MurmurConfig {
            name: self.name.clone(),
            ip_addr: self.ip_addr,
            port: self.port,
            probe_interval: self.probe_interval,
            rtt: self.rtt,
            indirect_checks: self.indirect_checks,
            gossip_interval: self.gossip_interval,
            gossip_nodes: self.gossip_nodes,
            push_pull_interval: self.push_pull_interval,
            suspicion_mult: self.suspicion_mult,
            initial_cluster_size: self.initial_cluster_size,
        }
    }
}

pub struct MurmurConfigBuilder {
    name: Option<String>,
    ip_addr: IpAddr,
    port: u16,
    probe_interval: Duration,
    rtt: Duration,
    indirect_checks: usize,
    gossip_interval: Duration,
    gossip_nodes: usize,
    push_pull_interval: Duration,
    suspicion_mult: u32,
    initial_cluster_size: usize,
}

impl Default for MurmurConfigBuilder {
    fn default() -> Self {
        Self {
            name: None,
            ip_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL),
            rtt: Duration::from_millis(DEFAULT_RTT),
            indirect_checks: DEFAULT_INDIRECT_CHECKS,
            gossip_interval: Duration::from_millis(DEFAULT_GOSSIP_INTERVAL),
            gossip_nodes: DEFAULT_GOSSIP_NODES,
            push_pull_interval: Duration::from_millis(DEFAULT_PUSH_PULL_INTERVAL),
            suspicion_mult: DEFAULT_SUSPICION_MULT,
            initial_cluster_size: 1,
        }
    }
}

impl MurmurConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the node name. Defaults to the machine hostname.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_addr(mut self, addr: impl Into<IpAddress>) -> Self {
        self.ip_addr = addr.into().0;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the failure detection period. Zero disables probing.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the direct-ping wait before indirect probing kicks in.
    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }

    pub fn with_indirect_checks(mut self, checks: usize) -> Self {
        self.indirect_checks = checks;
        self
    }

    /// Sets the gossip period. Zero disables gossip.
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_gossip_nodes(mut self, nodes: usize) -> Self {
        self.gossip_nodes = nodes;
        self
    }

    /// Sets the anti-entropy period. Zero disables state exchanges.
    pub fn with_push_pull_interval(mut self, interval: Duration) -> Self {
        self.push_pull_interval = interval;
        self
    }

    pub fn with_suspicion_mult(mut self, mult: u32) -> Self {
        self.suspicion_mult = mult;
        self
    }

    pub fn with_cluster_size(mut self, size: usize) -> Self {
        self.initial_cluster_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("bind port is not set");
        }
        if self.rtt.is_zero() {
            anyhow::bail!("round trip time is not set");
        }
        if self.suspicion_mult == 0 {
            anyhow::bail!("suspicion multiplier must be greater than zero");
        }
        if self.initial_cluster_size == 0 {
            anyhow::bail!("cluster size must be greater than zero");
        }
        if !self.probe_interval.is_zero() && self.rtt >= self.probe_interval {
            anyhow::bail!("round trip time must be below the probe interval");
        }
        Ok(())
    }

    pub fn build(mut self) -> Result<MurmurConfig> {
        self.fill();
        self.validate()?;

        Ok(MurmurConfig {
            name: self.name.unwrap_or_default(),
            ip_addr: self.ip_addr,
            port: self.port,
            probe_interval: self.probe_interval,
            rtt: self.rtt,
            indirect_checks: self.indirect_checks,
            gossip_interval: self.gossip_interval,
            gossip_nodes: self.gossip_nodes,
            push_pull_interval: self.push_pull_interval,
            suspicion_mult: self.suspicion_mult,
            initial_cluster_size: self.initial_cluster_size,
        })
    }

    fn fill(&mut self) {
        if self.name.is_none() {
            self.name = Some(gethostname().to_string_lossy().into_owned());
        }
    }
}
