use crate::clock::{wall_clock, ClockError, ClockSource, TransportSnapshot};
use crate::protocol::{Datagram, ProtocolError, StateReply, TransportCommand, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Local transport state is polled at 10 Hz.
pub const STATE_POLL_PERIOD_MS: u64 = 100;

/// A frame jump larger than this between emissions forces a state event even
/// when the state string is unchanged. Debounces the listener feed during
/// normal playback.
pub const FRAME_JUMP_THRESHOLD: u64 = 100;

const STATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),
}

#[derive(Debug, Clone, Copy)]
enum ScheduledAction {
    Start,
    Stop,
    LocateStart(u64),
}

impl ScheduledAction {
    fn name(&self) -> &'static str {
        match self {
            ScheduledAction::Start => "start",
            ScheduledAction::Stop => "stop",
            ScheduledAction::LocateStart(_) => "locate_start",
        }
    }
}

struct AgentInner {
    node_id: String,
    socket: UdpSocket,
    clock: Arc<dyn ClockSource>,
    reply_to: Option<SocketAddr>,
}

/// Node-side executor of scheduled transport commands. Binds a UDP control
/// endpoint, executes addressed commands against the local [`ClockSource`]
/// at the requested wall-clock instant, and reports state changes.
pub struct TransportAgent {
    inner: Arc<AgentInner>,
    local_addr: SocketAddr,
}

/// Running agent: the control endpoint address, the state-change feed, and
/// the loop tasks.
pub struct AgentHandle {
    pub local_addr: SocketAddr,
    pub states: mpsc::Receiver<TransportSnapshot>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TransportAgent {
    pub async fn bind(
        bind_addr: &str,
        node_id: String,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, AgentError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            inner: Arc::new(AgentInner {
                node_id,
                socket,
                clock,
                reply_to: None,
            }),
            local_addr,
        })
    }

    /// Fixed destination for `/transport/state` replies. Without one, query
    /// replies go back to the datagram's sender.
    pub fn with_reply_to(mut self, addr: SocketAddr) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reply_to = Some(addr);
        }
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the dispatch loop and the state poll loop.
    pub fn spawn(self) -> AgentHandle {
        let (state_tx, state_rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);

        let dispatch = Arc::clone(&self.inner);
        let dispatch_task = tokio::spawn(async move {
            run_dispatch_loop(dispatch).await;
        });

        let poll = Arc::clone(&self.inner);
        let poll_task = tokio::spawn(async move {
            run_state_poll_loop(poll, state_tx).await;
        });

        info!("transport agent listening on {}", self.local_addr);
        AgentHandle {
            local_addr: self.local_addr,
            states: state_rx,
            tasks: vec![dispatch_task, poll_task],
        }
    }
}

async fn run_dispatch_loop(inner: Arc<AgentInner>) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
    loop {
        let (len, sender) = match inner.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("agent receive error: {}", e);
                continue;
            }
        };

        let datagram = match Datagram::decode(&buf[..len]) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("malformed command from {}: {}", sender, e);
                continue;
            }
        };

        match TransportCommand::from_datagram(&datagram) {
            Ok(command) => handle_command(&inner, command, sender).await,
            Err(e) => {
                // Unknown addresses are warnings, never fatal and never
                // replied to.
                warn!(
                    "unhandled command {} from {}: {}",
                    datagram.address, sender, e
                );
            }
        }
    }
}

async fn handle_command(inner: &Arc<AgentInner>, command: TransportCommand, sender: SocketAddr) {
    match command {
        TransportCommand::Start { target_time } => {
            schedule_action(inner, target_time, ScheduledAction::Start);
        }
        TransportCommand::Stop { target_time } => {
            schedule_action(inner, target_time, ScheduledAction::Stop);
        }
        TransportCommand::LocateStart { frame, target_time } => {
            schedule_action(inner, Some(target_time), ScheduledAction::LocateStart(frame));
        }
        TransportCommand::Locate { frame } => {
            if let Err(e) = inner.clock.locate(frame) {
                warn!("locate to frame {} failed: {}", frame, e);
            } else {
                debug!("located to frame {}", frame);
            }
        }
        TransportCommand::Query => {
            send_state_reply(inner, sender).await;
        }
    }
}

/// Spawn one independent timer task per scheduled command. Commands race
/// freely; nothing cancels an earlier schedule, so a later stop with an
/// earlier deadline can execute before a pending start.
fn schedule_action(inner: &Arc<AgentInner>, target_time: Option<f64>, action: ScheduledAction) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let target = target_time.unwrap_or_else(wall_clock);
        let delay = target - wall_clock();
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let result = match action {
            ScheduledAction::Start => inner.clock.start(),
            ScheduledAction::Stop => inner.clock.stop(),
            ScheduledAction::LocateStart(frame) => {
                // Locate then start back-to-back; no atomicity against a
                // concurrently arriving stop.
                inner.clock.locate(frame).and_then(|()| inner.clock.start())
            }
        };

        match result {
            Ok(()) => {
                // Diagnostic only; drift is never fed back into correction.
                let drift_ms = (wall_clock() - target) * 1000.0;
                info!(
                    "executed scheduled {} (drift {:+.3} ms)",
                    action.name(),
                    drift_ms
                );
            }
            Err(e) => {
                warn!("scheduled {} failed: {}", action.name(), e);
            }
        }
    });
}

async fn send_state_reply(inner: &Arc<AgentInner>, sender: SocketAddr) {
    let (state, frame) = match inner.clock.query() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("transport query failed: {}", e);
            return;
        }
    };

    let reply = StateReply {
        state,
        frame,
        timestamp: wall_clock(),
        node_id: inner.node_id.clone(),
    };
    let destination = inner.reply_to.unwrap_or(sender);
    match reply.encode() {
        Ok(payload) => {
            if let Err(e) = inner.socket.send_to(payload.as_bytes(), destination).await {
                warn!("state reply to {} failed: {}", destination, e);
            }
        }
        Err(e) => warn!("state reply encode failed: {}", e),
    }
}

async fn run_state_poll_loop(inner: Arc<AgentInner>, states: mpsc::Sender<TransportSnapshot>) {
    let mut interval = tokio::time::interval(Duration::from_millis(STATE_POLL_PERIOD_MS));
    let mut last_emitted: Option<TransportSnapshot> = None;
    let mut clock_down = false;

    loop {
        interval.tick().await;

        let (state, frame) = match inner.clock.query() {
            Ok(snapshot) => {
                clock_down = false;
                snapshot
            }
            Err(e) => {
                if !clock_down {
                    warn!("state poll lost the clock source: {}", e);
                    clock_down = true;
                }
                continue;
            }
        };

        let emit = match &last_emitted {
            None => true,
            Some(previous) => {
                state != previous.state || frame.abs_diff(previous.frame) > FRAME_JUMP_THRESHOLD
            }
        };
        if !emit {
            continue;
        }

        let snapshot = TransportSnapshot {
            state,
            frame,
            timestamp: wall_clock(),
        };
        last_emitted = Some(snapshot);
        if states.send(snapshot).await.is_err() {
            // Listener gone; keep polling so a reattached listener resumes.
            last_emitted = None;
        }
    }
}
