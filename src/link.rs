//! Connectivity supervision for the network and broker links.
//!
//! Each link gets a [`LinkSupervisor`] that rations connect attempts: a fixed
//! backoff between failures, and once the budget is spent a give-up period
//! during which nothing is attempted. Attempts are deadlines checked on each
//! service call; nothing here sleeps.

use crate::config::{LoggerConfig, RetryPolicy};
use crate::ports::{BrokerError, BrokerTransport, InboundMessage};
use heapless::Deque;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Capacity of the inbound queue; the configured depth may only lower it.
pub const MAX_INBOUND_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSupervisor {
    name: &'static str,
    policy: RetryPolicy,
    state: LinkState,
    failures: u8,
    gave_up: bool,
    cooldown_until_ms: Option<u64>,
    next_attempt_ms: u64,
}

impl LinkSupervisor {
    pub fn new(name: &'static str, policy: RetryPolicy) -> Self {
        Self {
            name,
            policy,
            state: LinkState::Disconnected,
            failures: 0,
            gave_up: false,
            cooldown_until_ms: None,
            next_attempt_ms: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    pub fn cooldown_until_ms(&self) -> Option<u64> {
        self.cooldown_until_ms
    }

    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        self.gave_up && self.cooldown_until_ms.is_some_and(|until| now_ms < until)
    }

    /// Whether a connect attempt is allowed at `now_ms`.
    pub fn may_attempt(&self, now_ms: u64) -> bool {
        self.state != LinkState::Connected && !self.in_cooldown(now_ms) && now_ms >= self.next_attempt_ms
    }

    pub fn begin_attempt(&mut self) {
        self.state = LinkState::Connecting;
    }

    pub fn record_success(&mut self) {
        if self.gave_up {
            info!(link = self.name, "link recovered; give-up cleared");
        }
        self.state = LinkState::Connected;
        self.failures = 0;
        self.gave_up = false;
        self.cooldown_until_ms = None;
        self.next_attempt_ms = 0;
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.state = LinkState::Disconnected;
        if self.gave_up {
            // Probe after cooldown failed; wait out another full cooldown.
            self.cooldown_until_ms = Some(now_ms.saturating_add(self.policy.cooldown_ms));
            warn!(link = self.name, cooldown_ms = self.policy.cooldown_ms, "link still down; cooldown re-armed");
            return;
        }

        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            self.gave_up = true;
            self.failures = 0;
            self.cooldown_until_ms = Some(now_ms.saturating_add(self.policy.cooldown_ms));
            error!(
                link = self.name,
                attempts = self.policy.max_attempts,
                cooldown_ms = self.policy.cooldown_ms,
                "giving up on link"
            );
        } else {
            self.next_attempt_ms = now_ms.saturating_add(self.policy.backoff_ms);
            debug!(link = self.name, failures = self.failures, "connect attempt failed");
        }
    }

    /// A connected link dropped; the next attempt may run immediately.
    pub fn mark_lost(&mut self) {
        if self.state == LinkState::Connected {
            warn!(link = self.name, "link lost");
            self.state = LinkState::Disconnected;
            self.next_attempt_ms = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub network_connects: u32,
    pub broker_connects: u32,
    pub connect_failures: u32,
    pub inbound_received: u32,
    pub inbound_dropped: u32,
}

/// The broker session: both link supervisors, identity and the inbound queue.
pub struct BrokerLink<M: BrokerTransport> {
    transport: M,
    network: LinkSupervisor,
    broker: LinkSupervisor,
    identity: alloc::string::String,
    username: alloc::string::String,
    password: alloc::string::String,
    config_topic: alloc::string::String,
    subscribed: bool,
    inbound: Deque<InboundMessage, MAX_INBOUND_QUEUE>,
    queue_depth: usize,
    stats: LinkStats,
}

impl<M: BrokerTransport> BrokerLink<M> {
    pub fn new(transport: M, config: &LoggerConfig) -> Self {
        Self {
            transport,
            network: LinkSupervisor::new("network", config.retry),
            broker: LinkSupervisor::new("broker", config.retry),
            identity: config.device_id.clone(),
            username: config.tenant.clone(),
            password: config.password.clone(),
            config_topic: config.config_topic(),
            subscribed: false,
            inbound: Deque::new(),
            queue_depth: config.inbound_queue_depth.clamp(1, MAX_INBOUND_QUEUE),
            stats: LinkStats::default(),
        }
    }

    pub fn transport(&self) -> &M {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut M {
        &mut self.transport
    }

    pub fn into_transport(self) -> M {
        self.transport
    }

    pub fn network(&self) -> &LinkSupervisor {
        &self.network
    }

    pub fn broker(&self) -> &LinkSupervisor {
        &self.broker
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn config_topic(&self) -> &str {
        &self.config_topic
    }

    /// The config channel subscription is in place on the current session.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn is_connected(&self) -> bool {
        self.transport.network_connected() && self.transport.connected()
    }

    /// Either link is sitting out its give-up period.
    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        self.network.in_cooldown(now_ms) || self.broker.in_cooldown(now_ms)
    }

    /// Once per loop iteration: housekeeping, scheduled reconnects and
    /// collection of inbound messages.
    pub fn service(&mut self, now_ms: u64) {
        self.transport.service();
        self.ensure_connected(now_ms, false);
        while let Some(message) = self.transport.poll_inbound() {
            self.enqueue(message);
        }
    }

    /// One immediate attempt outside the backoff schedule. Give-up cooldowns
    /// are still honoured.
    pub fn reconnect(&mut self, now_ms: u64) -> bool {
        self.ensure_connected(now_ms, true);
        self.is_connected()
    }

    pub fn publish(&mut self, topic: &str, payload: &str) -> bool {
        self.is_connected() && self.transport.publish(topic, payload)
    }

    pub fn pop_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound.pop_front()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    fn ensure_connected(&mut self, now_ms: u64, immediate: bool) {
        if !self.transport.network_connected() {
            self.subscribed = false;
            self.network.mark_lost();
            self.broker.mark_lost();
            if self.network.in_cooldown(now_ms) || !(immediate || self.network.may_attempt(now_ms)) {
                return;
            }
            self.network.begin_attempt();
            match self.transport.connect_network() {
                Ok(()) => {
                    self.network.record_success();
                    self.stats.network_connects = self.stats.network_connects.saturating_add(1);
                    info!("network link up");
                }
                Err(e) => {
                    self.stats.connect_failures = self.stats.connect_failures.saturating_add(1);
                    warn!(error = %e, "network connect failed");
                    self.network.record_failure(now_ms);
                    return;
                }
            }
        } else if self.network.state() != LinkState::Connected {
            self.network.record_success();
        }

        if self.transport.connected() {
            if self.broker.state() != LinkState::Connected {
                self.broker.record_success();
            }
            self.ensure_subscribed();
            return;
        }
        self.subscribed = false;
        self.broker.mark_lost();
        if self.broker.in_cooldown(now_ms) || !(immediate || self.broker.may_attempt(now_ms)) {
            return;
        }

        self.broker.begin_attempt();
        match self.open_session() {
            Ok(()) => {
                self.broker.record_success();
                self.stats.broker_connects = self.stats.broker_connects.saturating_add(1);
                info!(identity = %self.identity, topic = %self.config_topic, "broker session open");
            }
            Err(e) => {
                self.stats.connect_failures = self.stats.connect_failures.saturating_add(1);
                warn!(error = %e, "broker connect failed");
                self.broker.record_failure(now_ms);
            }
        }
    }

    fn open_session(&mut self) -> Result<(), BrokerError> {
        self.transport.connect(&self.identity, &self.username, &self.password)?;
        self.subscribed = false;
        self.ensure_subscribed();
        Ok(())
    }

    /// Once per session, whoever opened it. A failed subscribe is retried on
    /// the next service call.
    fn ensure_subscribed(&mut self) {
        if self.subscribed {
            return;
        }
        if self.transport.subscribe(&self.config_topic) {
            self.subscribed = true;
            debug!(topic = %self.config_topic, "config channel subscribed");
        } else {
            warn!(topic = %self.config_topic, "config subscription failed");
        }
    }

    fn enqueue(&mut self, message: InboundMessage) {
        self.stats.inbound_received = self.stats.inbound_received.saturating_add(1);
        while self.inbound.len() >= self.queue_depth {
            if let Some(dropped) = self.inbound.pop_front() {
                self.stats.inbound_dropped = self.stats.inbound_dropped.saturating_add(1);
                warn!(topic = %dropped.topic, "inbound queue full; oldest message dropped");
            }
        }
        if let Err(message) = self.inbound.push_back(message) {
            self.stats.inbound_dropped = self.stats.inbound_dropped.saturating_add(1);
            warn!(topic = %message.topic, "inbound message dropped");
        }
    }
}
