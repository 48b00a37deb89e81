use crate::protocol::{BusEvent, ProtocolError};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const BUS_CHANNEL_CAPACITY: usize = 256;

/// Per-node publish/subscribe fabric. Every node exposes one TCP publish
/// endpoint; each connected subscriber receives every local service event as
/// one JSON line. Subscriptions to peers are additive only: a dead peer's
/// connection simply stops producing traffic.
#[derive(Clone)]
pub struct ServiceBus {
    outbound: broadcast::Sender<String>,
}

impl ServiceBus {
    pub fn new() -> Self {
        let (outbound, _) = broadcast::channel(BUS_CHANNEL_CAPACITY);
        Self { outbound }
    }

    /// Publish one event to all currently connected subscribers. Having no
    /// subscribers is not an error; delivery is at-most-once.
    pub fn publish(&self, event: &BusEvent) -> Result<(), ProtocolError> {
        let line = event.encode()?;
        let _ = self.outbound.send(line);
        Ok(())
    }

    /// Bind the publish endpoint and fan out events to every subscriber that
    /// connects. A slow or dead subscriber is dropped, never waited on.
    pub async fn serve(&self, bind_addr: &str) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let outbound = self.outbound.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        info!("bus subscriber connected: {}", addr);
                        let rx = outbound.subscribe();
                        tokio::spawn(async move {
                            forward_events(stream, rx).await;
                            info!("bus subscriber disconnected: {}", addr);
                        });
                    }
                    Err(e) => {
                        warn!("bus accept failed: {}", e);
                    }
                }
            }
        });

        Ok((local_addr, task))
    }

    /// Open one subscription connection to a peer's publish endpoint and
    /// forward its events into `events`. A failed connect is logged and the
    /// task ends; there is no retry and no unsubscribe.
    pub fn subscribe_to_peer(
        &self,
        host: &str,
        port: u16,
        events: mpsc::Sender<BusEvent>,
    ) -> JoinHandle<()> {
        let peer = format!("{}:{}", host, port);
        tokio::spawn(async move {
            let stream = match TcpStream::connect(&peer).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("bus subscription to {} failed: {}", peer, e);
                    return;
                }
            };
            info!("subscribed to peer bus at {}", peer);

            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match BusEvent::decode(trimmed) {
                            Ok(event) => {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("malformed bus event from {}: {}", peer, e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("bus read error from {}: {}", peer, e);
                        break;
                    }
                }
            }
            info!("peer bus {} went quiet", peer);
        })
    }
}

impl Default for ServiceBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward_events(mut stream: TcpStream, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                if stream.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stream.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Best-effort channel: a lagging subscriber just misses events.
                warn!("bus subscriber lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
