use crate::ports::{BrokerError, BrokerTransport, InboundMessage};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use tracing::trace;

/// Broker client whose failures are scripted by count.
#[derive(Debug, Default)]
pub struct ScriptedBroker {
    network_up: bool,
    session_up: bool,
    /// Upcoming network connect attempts that fail.
    pub network_failures: u32,
    /// Upcoming broker connect attempts that fail.
    pub connect_failures: u32,
    /// Upcoming publishes that fail.
    pub publish_failures: u32,
    pub network_attempts: u32,
    pub connect_attempts: u32,
    pub service_calls: u32,
    subscriptions: Vec<String>,
    published: Vec<(String, String)>,
    inbound: VecDeque<InboundMessage>,
    last_identity: Option<(String, String)>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network and session already up.
    pub fn online() -> Self {
        Self {
            network_up: true,
            session_up: true,
            ..Self::default()
        }
    }

    pub fn failing_connects(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    pub fn failing_publishes(mut self, count: u32) -> Self {
        self.publish_failures = count;
        self
    }

    /// Drop the broker session without touching the network.
    pub fn drop_session(&mut self) {
        self.session_up = false;
    }

    pub fn drop_network(&mut self) {
        self.network_up = false;
        self.session_up = false;
    }

    /// Queue a downlink delivered on the next poll.
    pub fn deliver(&mut self, topic: &str, payload: &str) {
        self.inbound.push_back(InboundMessage::new(topic, payload));
    }

    pub fn published(&self) -> &[(String, String)] {
        &self.published
    }

    pub fn take_published(&mut self) -> Vec<(String, String)> {
        core::mem::take(&mut self.published)
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// `(identity, username)` of the last session opened.
    pub fn last_identity(&self) -> Option<&(String, String)> {
        self.last_identity.as_ref()
    }
}

impl BrokerTransport for ScriptedBroker {
    fn network_connected(&self) -> bool {
        self.network_up
    }

    fn connect_network(&mut self) -> Result<(), BrokerError> {
        self.network_attempts += 1;
        if self.network_failures > 0 {
            self.network_failures -= 1;
            return Err(BrokerError::Unreachable);
        }
        self.network_up = true;
        Ok(())
    }

    fn connect(&mut self, identity: &str, username: &str, _password: &str) -> Result<(), BrokerError> {
        self.connect_attempts += 1;
        if !self.network_up {
            return Err(BrokerError::NetworkDown);
        }
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(BrokerError::Refused(-2));
        }
        self.session_up = true;
        self.last_identity = Some((identity.into(), username.into()));
        Ok(())
    }

    fn connected(&self) -> bool {
        self.network_up && self.session_up
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        if !self.connected() {
            return false;
        }
        if !self.subscriptions.iter().any(|existing| existing == topic) {
            self.subscriptions.push(topic.into());
        }
        true
    }

    fn publish(&mut self, topic: &str, payload: &str) -> bool {
        if !self.connected() {
            return false;
        }
        if self.publish_failures > 0 {
            self.publish_failures -= 1;
            return false;
        }
        trace!(topic, payload, "simulated publish");
        self.published.push((topic.into(), payload.into()));
        true
    }

    fn service(&mut self) {
        self.service_calls += 1;
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        if self.connected() {
            self.inbound.pop_front()
        } else {
            None
        }
    }
}
