use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::node::NodeMetadata;
use crate::transport::TransportChannel;
use crate::Murmur;

/// Drains inbound traffic from the transport into the protocol handlers.
pub(crate) struct MurmurListener<M>
where
    M: NodeMetadata,
{
    murmur: Murmur<M>,
    channel: TransportChannel,
}

impl<M: NodeMetadata> MurmurListener<M> {
    pub(crate) fn new(murmur: Murmur<M>, channel: TransportChannel) -> Self {
        Self { murmur, channel }
    }

    pub(crate) async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                packet = self.channel.packet_rx.recv() => {
                    let Some((from, payload)) = packet else { break };
                    let murmur = self.murmur.clone();
                    tokio::spawn(async move {
                        murmur.handle_datagram(from, payload).await;
                    });
                }
                stream = self.channel.stream_rx.recv() => {
                    let Some((from, stream)) = stream else { break };
                    let murmur = self.murmur.clone();
                    tokio::spawn(async move {
                        if let Err(e) = murmur.handle_push_pull_stream(stream).await {
                            debug!(%from, "state exchange failed: {}", e);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("listener shutting down");
                    break;
                }
            }
        }
    }
}
