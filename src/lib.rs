//! # StageLink
//!
//! A LAN mesh for synchronized media-transport control: peer discovery over
//! UDP broadcast, a per-node publish/subscribe service bus, a heartbeat-based
//! service registry with optional durable store, and a coordinator/agent pair
//! that executes wall-clock-scheduled transport commands in lockstep across
//! machines.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stagelink::agent::TransportAgent;
//! use stagelink::clock::SoftwareClock;
//! use stagelink::coordinator::TransportCoordinator;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // Node side: execute scheduled commands against the local clock.
//! let clock = Arc::new(SoftwareClock::default());
//! let agent = TransportAgent::bind("0.0.0.0:9752", "node-a".into(), clock).await?;
//! let _handle = agent.spawn();
//!
//! // Operator side: fan a synchronized start out to the roster.
//! let coordinator = TransportCoordinator::bind().await?;
//! coordinator.add_agent("192.168.1.10", None, Some("stage left"));
//! coordinator.start_all(0.5).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Wire formats: command datagrams, state replies, bus events
//! - [`clock`] - The [`clock::ClockSource`] seam and built-in software clock
//! - [`agent`] - Node-side scheduled command execution
//! - [`coordinator`] - Operator-side command fan-out and state tracking
//! - [`discovery`] - UDP broadcast beacon and known-nodes table
//! - [`bus`] - TCP line-delimited publish/subscribe fabric
//! - [`registry`] - Heartbeat-TTL service registry
//! - [`store`] - Optional SQLite persistence for the registry
//! - [`node`] - One running mesh participant wiring the above together

pub mod agent;
pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod store;

pub use agent::{AgentHandle, TransportAgent};
pub use clock::{ClockSource, SoftwareClock, TransportSnapshot, TransportState};
pub use config::NodeConfig;
pub use coordinator::TransportCoordinator;
pub use node::MeshNode;
pub use registry::{ServiceRecord, ServiceRegistry, ServiceType};
