use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{read_push_pull, write_push_pull, MAX_UDP_PACKET_SIZE};
use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;
use crate::message::PushNodeState;

pub(crate) type DatagramPacket = (SocketAddr, Vec<u8>);
pub(crate) type IncomingStream = (SocketAddr, TcpStream);

/// Inbound side of a transport: decoded-but-unparsed datagrams plus
/// accepted state-exchange streams.
pub struct TransportChannel {
    pub(crate) packet_rx: mpsc::Receiver<DatagramPacket>,
    pub(crate) stream_rx: mpsc::Receiver<IncomingStream>,
}

/// Network seam of the protocol: unreliable datagrams for probes and
/// gossip, plus a reliable full-state exchange RPC.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// The address peers should use to reach this node.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Fire-and-forget datagram send.
    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<()>;

    /// Sends our full state to `addr` and returns the peer's in exchange.
    async fn send_and_receive_state(
        &self,
        addr: SocketAddr,
        local: Vec<PushNodeState>,
    ) -> Result<Vec<PushNodeState>>;

    async fn shutdown(&self) -> Result<()>;
}

/// UDP + TCP transport bound to a single local address.
pub struct DefaultTransport {
    local_addr: SocketAddr,
    udp_socket: Arc<UdpSocket>,
    dial_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DefaultTransport {
    /// Binds the UDP socket and TCP listener and starts pumping inbound
    /// traffic into the returned channel.
    pub async fn new(ip_addr: IpAddr, port: u16) -> Result<(Self, TransportChannel)> {
        let bind_addr = SocketAddr::new(ip_addr, port);

        let udp_socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .context("failed to bind UDP socket")?,
        );
        let tcp_listener = TcpListener::bind(bind_addr)
            .await
            .context("failed to bind TCP listener")?;

        let local_addr = udp_socket.local_addr()?;
        let (packet_tx, packet_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (stream_tx, stream_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);

        let transport = Self {
            local_addr,
            udp_socket: Arc::clone(&udp_socket),
            dial_timeout: Duration::from_secs(5),
            tasks: Mutex::new(vec![
                tokio::spawn(Self::udp_listener(udp_socket, packet_tx)),
                tokio::spawn(Self::tcp_listener(tcp_listener, stream_tx)),
            ]),
        };

        Ok((
            transport,
            TransportChannel {
                packet_rx,
                stream_rx,
            },
        ))
    }

    async fn udp_listener(socket: Arc<UdpSocket>, packet_tx: mpsc::Sender<DatagramPacket>) {
        let mut buffer = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, from)) => {
                    if packet_tx.send((from, buffer[..len].to_vec())).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("failed to receive datagram: {}", e),
            }
        }
    }

    async fn tcp_listener(listener: TcpListener, stream_tx: mpsc::Sender<IncomingStream>) {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    debug!(%from, "accepted state exchange stream");
                    if stream_tx.send((from, stream)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("failed to accept stream: {}", e),
            }
        }
    }
}

#[async_trait]
impl NodeTransport for DefaultTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_UDP_PACKET_SIZE {
            return Err(anyhow!(
                "datagram exceeds {} bytes: {}",
                MAX_UDP_PACKET_SIZE,
                payload.len()
            ));
        }
        self.udp_socket
            .send_to(payload, addr)
            .await
            .map(|_| ())
            .context("failed to send datagram")
    }

    async fn send_and_receive_state(
        &self,
        addr: SocketAddr,
        local: Vec<PushNodeState>,
    ) -> Result<Vec<PushNodeState>> {
        let mut stream = timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connection to {} timed out", addr))?
            .context("failed to establish state exchange stream")?;

        write_push_pull(&mut stream, local).await?;
        read_push_pull(&mut stream).await
    }

    async fn shutdown(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}
