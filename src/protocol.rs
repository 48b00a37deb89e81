use crate::clock::TransportState;
use crate::registry::ServiceRecord;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// One JSON document per UDP datagram; anything larger is rejected on both
/// sides rather than silently truncated.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

pub const ADDR_START: &str = "/transport/start";
pub const ADDR_STOP: &str = "/transport/stop";
pub const ADDR_LOCATE: &str = "/transport/locate";
pub const ADDR_LOCATE_START: &str = "/transport/locate_start";
pub const ADDR_QUERY: &str = "/transport/query";
pub const ADDR_STATE: &str = "/transport/state";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON payload")]
    InvalidJson,
    #[error("message exceeds {MAX_DATAGRAM_SIZE} byte datagram limit")]
    MessageTooLarge,
    #[error("unknown address: {0}")]
    UnknownAddress(String),
    #[error("missing argument: {0}")]
    MissingArg(&'static str),
    #[error("bad argument: {0}")]
    BadArg(&'static str),
    #[error("serialization failed")]
    SerializationError,
}

/// Addressed command envelope: `{ "address": "/transport/...", "args": [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datagram {
    pub address: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Datagram {
    pub fn new(address: &str, args: Vec<Value>) -> Self {
        Self {
            address: address.to_string(),
            args,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let encoded =
            serde_json::to_string(self).map_err(|_| ProtocolError::SerializationError)?;
        if encoded.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(encoded)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_slice(bytes).map_err(|_| ProtocolError::InvalidJson)
    }
}

fn arg_f64(args: &[Value], index: usize, name: &'static str) -> Result<f64, ProtocolError> {
    args.get(index)
        .ok_or(ProtocolError::MissingArg(name))?
        .as_f64()
        .ok_or(ProtocolError::BadArg(name))
}

fn arg_u64(args: &[Value], index: usize, name: &'static str) -> Result<u64, ProtocolError> {
    args.get(index)
        .ok_or(ProtocolError::MissingArg(name))?
        .as_u64()
        .ok_or(ProtocolError::BadArg(name))
}

fn arg_str<'a>(
    args: &'a [Value],
    index: usize,
    name: &'static str,
) -> Result<&'a str, ProtocolError> {
    args.get(index)
        .ok_or(ProtocolError::MissingArg(name))?
        .as_str()
        .ok_or(ProtocolError::BadArg(name))
}

/// Coordinator-to-agent scheduling commands. `target_time` is wall-clock
/// fractional epoch seconds; `None` means "execute now".
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Start { target_time: Option<f64> },
    Stop { target_time: Option<f64> },
    Locate { frame: u64 },
    LocateStart { frame: u64, target_time: f64 },
    Query,
}

impl TransportCommand {
    pub fn to_datagram(&self) -> Datagram {
        match self {
            TransportCommand::Start { target_time } => {
                Datagram::new(ADDR_START, target_time.iter().map(|t| json!(t)).collect())
            }
            TransportCommand::Stop { target_time } => {
                Datagram::new(ADDR_STOP, target_time.iter().map(|t| json!(t)).collect())
            }
            TransportCommand::Locate { frame } => Datagram::new(ADDR_LOCATE, vec![json!(frame)]),
            TransportCommand::LocateStart { frame, target_time } => {
                Datagram::new(ADDR_LOCATE_START, vec![json!(frame), json!(target_time)])
            }
            TransportCommand::Query => Datagram::new(ADDR_QUERY, vec![]),
        }
    }

    pub fn from_datagram(datagram: &Datagram) -> Result<Self, ProtocolError> {
        let args = &datagram.args;
        match datagram.address.as_str() {
            ADDR_START => Ok(TransportCommand::Start {
                target_time: match args.first() {
                    Some(v) => Some(v.as_f64().ok_or(ProtocolError::BadArg("target_time"))?),
                    None => None,
                },
            }),
            ADDR_STOP => Ok(TransportCommand::Stop {
                target_time: match args.first() {
                    Some(v) => Some(v.as_f64().ok_or(ProtocolError::BadArg("target_time"))?),
                    None => None,
                },
            }),
            ADDR_LOCATE => Ok(TransportCommand::Locate {
                frame: arg_u64(args, 0, "frame")?,
            }),
            ADDR_LOCATE_START => Ok(TransportCommand::LocateStart {
                frame: arg_u64(args, 0, "frame")?,
                target_time: arg_f64(args, 1, "target_time")?,
            }),
            ADDR_QUERY => Ok(TransportCommand::Query),
            other => Err(ProtocolError::UnknownAddress(other.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_datagram().encode()
    }
}

/// Agent-to-coordinator state reply. Carries the replying agent's `node_id`
/// so the coordinator can attribute it to a single roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StateReply {
    pub state: TransportState,
    pub frame: u64,
    pub timestamp: f64,
    pub node_id: String,
}

impl StateReply {
    pub fn to_datagram(&self) -> Datagram {
        Datagram::new(
            ADDR_STATE,
            vec![
                json!(self.state.as_str()),
                json!(self.frame),
                json!(self.timestamp),
                json!(self.node_id),
            ],
        )
    }

    pub fn from_datagram(datagram: &Datagram) -> Result<Self, ProtocolError> {
        if datagram.address != ADDR_STATE {
            return Err(ProtocolError::UnknownAddress(datagram.address.clone()));
        }
        let args = &datagram.args;
        let state = TransportState::parse(arg_str(args, 0, "state")?)
            .ok_or(ProtocolError::BadArg("state"))?;
        Ok(StateReply {
            state,
            frame: arg_u64(args, 1, "frame")?,
            timestamp: arg_f64(args, 2, "timestamp")?,
            node_id: arg_str(args, 3, "node_id")?.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_datagram().encode()
    }
}

/// Discovery broadcast payload, sent to the subnet broadcast address every
/// beacon period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: String,
    pub node_name: String,
    pub host: String,
    pub pub_port: u16,
    pub timestamp: f64,
}

impl Announcement {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let encoded =
            serde_json::to_string(self).map_err(|_| ProtocolError::SerializationError)?;
        if encoded.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(encoded)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_slice(bytes).map_err(|_| ProtocolError::InvalidJson)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusAction {
    Registered,
    Unregistered,
    Heartbeat,
    HealthUpdate,
}

/// Service-state event, one JSON line per event on the bus channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub action: BusAction,
    pub service: ServiceRecord,
    pub timestamp: f64,
}

impl BusEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|_| ProtocolError::SerializationError)
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|_| ProtocolError::InvalidJson)
    }
}
