//! The gossip wire messages and their binary codec. A round is
//! SYN → ACK → ACK2; ECHO/ECHO_RESPONSE gate liveness promotion and
//! SHUTDOWN announces an orderly exit. Frames begin with a wire id byte;
//! unknown ids are fatal for the connection.

use crate::endpoint::EndpointId;
use crate::gossip::state::{
    AppStateKey, AppStateMap, EndpointState, HeartbeatState, VersionedValue,
};
use crate::wire::{
    read_endpoint, read_i32, read_string, read_u32, read_u8, write_endpoint, write_i32,
    write_string, write_u32, write_u8, ProtocolError,
};
use std::time::Instant;

/// Summary of what a node knows about one endpoint: its generation and the
/// highest version seen inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipDigest {
    pub endpoint: EndpointId,
    pub generation: i32,
    pub max_version: i32,
}

impl GossipDigest {
    pub fn new(endpoint: EndpointId, generation: i32, max_version: i32) -> Self {
        Self {
            endpoint,
            generation,
            max_version,
        }
    }
}

/// Opening message of a round. An empty digest list marks a shadow-round
/// request: the receiver answers with its complete state map.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipDigestSyn {
    pub cluster_name: String,
    pub partitioner_name: String,
    pub digests: Vec<GossipDigest>,
}

/// Reply to a SYN: what the sender still needs (`requests`) and what the
/// receiver was missing (`states`).
#[derive(Debug, Clone, PartialEq)]
pub struct GossipDigestAck {
    pub requests: Vec<GossipDigest>,
    pub states: Vec<(EndpointId, EndpointState)>,
}

/// Final leg of a round, carrying the states the ACK asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipDigestAck2 {
    pub states: Vec<(EndpointId, EndpointState)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GossipMessage {
    Syn(GossipDigestSyn),
    Ack(GossipDigestAck),
    Ack2(GossipDigestAck2),
    /// Empty payload; the sender address is the subject.
    Shutdown,
    Echo,
    EchoResponse,
}

const WIRE_SYN: u8 = 0x01;
const WIRE_ACK: u8 = 0x02;
const WIRE_ACK2: u8 = 0x03;
const WIRE_SHUTDOWN: u8 = 0x04;
const WIRE_ECHO: u8 = 0x05;
const WIRE_ECHO_RESPONSE: u8 = 0x06;

impl GossipMessage {
    pub fn encode(&self, version: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            GossipMessage::Syn(syn) => {
                write_u8(&mut buf, WIRE_SYN);
                write_string(&mut buf, &syn.cluster_name);
                write_string(&mut buf, &syn.partitioner_name);
                write_digests(&mut buf, &syn.digests, version);
            }
            GossipMessage::Ack(ack) => {
                write_u8(&mut buf, WIRE_ACK);
                write_digests(&mut buf, &ack.requests, version);
                write_state_map(&mut buf, &ack.states, version);
            }
            GossipMessage::Ack2(ack2) => {
                write_u8(&mut buf, WIRE_ACK2);
                write_state_map(&mut buf, &ack2.states, version);
            }
            GossipMessage::Shutdown => write_u8(&mut buf, WIRE_SHUTDOWN),
            GossipMessage::Echo => write_u8(&mut buf, WIRE_ECHO),
            GossipMessage::EchoResponse => write_u8(&mut buf, WIRE_ECHO_RESPONSE),
        }
        buf
    }

    /// Decodes one frame. `now` stamps the deserialized endpoint states'
    /// local bookkeeping; it never travels on the wire.
    pub fn decode(bytes: &[u8], version: u32, now: Instant) -> Result<Self, ProtocolError> {
        let mut bytes = bytes;
        let id = read_u8(&mut bytes)?;
        let message = match id {
            WIRE_SYN => GossipMessage::Syn(GossipDigestSyn {
                cluster_name: read_string(&mut bytes)?,
                partitioner_name: read_string(&mut bytes)?,
                digests: read_digests(&mut bytes)?,
            }),
            WIRE_ACK => GossipMessage::Ack(GossipDigestAck {
                requests: read_digests(&mut bytes)?,
                states: read_state_map(&mut bytes, now)?,
            }),
            WIRE_ACK2 => GossipMessage::Ack2(GossipDigestAck2 {
                states: read_state_map(&mut bytes, now)?,
            }),
            WIRE_SHUTDOWN => GossipMessage::Shutdown,
            WIRE_ECHO => GossipMessage::Echo,
            WIRE_ECHO_RESPONSE => GossipMessage::EchoResponse,
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(message)
    }
}

fn write_digests(buf: &mut Vec<u8>, digests: &[GossipDigest], version: u32) {
    write_u32(buf, digests.len() as u32);
    for digest in digests {
        write_endpoint(buf, &digest.endpoint, version);
        write_i32(buf, digest.generation);
        write_i32(buf, digest.max_version);
    }
}

fn read_digests(bytes: &mut &[u8]) -> Result<Vec<GossipDigest>, ProtocolError> {
    let count = read_u32(bytes)?;
    let mut digests = Vec::with_capacity(count as usize);
    for _ in 0..count {
        digests.push(GossipDigest {
            endpoint: read_endpoint(bytes, 0)?,
            generation: read_i32(bytes)?,
            max_version: read_i32(bytes)?,
        });
    }
    Ok(digests)
}

fn write_state_map(buf: &mut Vec<u8>, states: &[(EndpointId, EndpointState)], version: u32) {
    write_u32(buf, states.len() as u32);
    for (endpoint, state) in states {
        write_endpoint(buf, endpoint, version);
        write_endpoint_state(buf, state);
    }
}

fn read_state_map(
    bytes: &mut &[u8],
    now: Instant,
) -> Result<Vec<(EndpointId, EndpointState)>, ProtocolError> {
    let count = read_u32(bytes)?;
    let mut states = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let endpoint = read_endpoint(bytes, 0)?;
        let state = read_endpoint_state(bytes, now)?;
        states.push((endpoint, state));
    }
    Ok(states)
}

/// `HeartbeatState | int32 count | { int32 ordinal | VersionedValue }*`.
fn write_endpoint_state(buf: &mut Vec<u8>, state: &EndpointState) {
    let heartbeat = state.heartbeat();
    write_i32(buf, heartbeat.generation);
    write_i32(buf, heartbeat.version);
    let snapshot = state.snapshot();
    write_i32(buf, snapshot.len() as i32);
    for (key, value) in snapshot.iter() {
        write_u32(buf, key.ordinal());
        write_string(buf, &value.value);
        write_i32(buf, value.version);
    }
}

fn read_endpoint_state(bytes: &mut &[u8], now: Instant) -> Result<EndpointState, ProtocolError> {
    let generation = read_i32(bytes)?;
    let version = read_i32(bytes)?;
    let count = read_i32(bytes)?;
    let mut states = AppStateMap::new();
    for _ in 0..count {
        let ordinal = read_u32(bytes)?;
        let key =
            AppStateKey::from_ordinal(ordinal).ok_or(ProtocolError::UnknownStateKey(ordinal))?;
        let value = read_string(bytes)?;
        let value_version = read_i32(bytes)?;
        states.insert(key, VersionedValue::new(value, value_version));
    }
    Ok(EndpointState::with_states(
        HeartbeatState::with_version(generation, version),
        states,
        now,
    ))
}
