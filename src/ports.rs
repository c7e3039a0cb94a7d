//! Boundaries to the collaborators the logger core drives but does not own:
//! the bus line, the network/broker client, the key-value store and the local
//! log sink. Adapters for real hardware implement these; `crate::sim` provides
//! in-memory versions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bus line is not driven")]
    LineDown,
    #[error("command send failed: {0}")]
    SendFailed(alloc::string::String),
    #[error("framing error on receive")]
    Framing,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("network link is down")]
    NetworkDown,
    #[error("broker refused connection (state {0})")]
    Refused(i32),
    #[error("broker unreachable")]
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store is not writable")]
    ReadOnly,
    #[error("key '{0}' is not a valid store key")]
    InvalidKey(alloc::string::String),
    #[error("write of '{0}' failed")]
    WriteFailed(alloc::string::String),
}

/// Character-level access to the shared half-duplex sensor line.
///
/// `read` is non-blocking: it returns `nb::Error::WouldBlock` when no byte is
/// buffered. Framing beyond the command sentinel is the caller's concern.
pub trait BusTransport {
    fn send(&mut self, command: &[u8]) -> Result<(), TransportError>;
    fn read(&mut self) -> nb::Result<u8, TransportError>;
    fn available(&self) -> usize;
    /// Discard any buffered input.
    fn clear(&mut self);
}

/// Message delivered by the broker on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: alloc::string::String,
    pub payload: alloc::string::String,
}

impl InboundMessage {
    pub fn new(topic: &str, payload: &str) -> Self {
        Self {
            topic: alloc::string::ToString::to_string(topic),
            payload: alloc::string::ToString::to_string(payload),
        }
    }
}

/// Network link plus publish/subscribe client on top of it.
///
/// Inbound deliveries are pulled with `poll_inbound` instead of a callback so
/// the logger can queue and drain them in order.
pub trait BrokerTransport {
    fn network_connected(&self) -> bool;
    /// One bounded attempt to bring the network link up.
    fn connect_network(&mut self) -> Result<(), BrokerError>;
    /// One bounded attempt to open a broker session.
    fn connect(&mut self, identity: &str, username: &str, password: &str) -> Result<(), BrokerError>;
    fn connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> bool;
    fn publish(&mut self, topic: &str, payload: &str) -> bool;
    /// Keepalive and socket housekeeping; must run every loop iteration.
    fn service(&mut self);
    fn poll_inbound(&mut self) -> Option<InboundMessage>;
}

/// Typed persistent settings store. Reads fall back to `default` when the key
/// is missing or holds another type.
pub trait KeyValueStore {
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn get_i32(&self, key: &str, default: i32) -> i32;
    fn get_u32(&self, key: &str, default: u32) -> u32;
    fn get_u64(&self, key: &str, default: u64) -> u64;

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError>;
    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError>;
    fn put_u64(&mut self, key: &str, value: u64) -> Result<(), StoreError>;
}

/// Append-only local log, best-effort.
pub trait LogSink {
    fn append(&mut self, line: &str);
}
