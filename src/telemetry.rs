//! Telemetry channel naming, payload encoding and publishing.
//!
//! A batch goes out either joined (every value on the sensor's base channel,
//! `", "`-separated) or segmented (one publish per value on
//! `<base>/<letter>`). The same joined text is used for the local log line.

use crate::address::SensorAddress;
use crate::codec::Reading;
use crate::cycle::ReadingBatch;
use crate::link::BrokerLink;
use crate::ports::BrokerTransport;
use core::fmt::Write;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_TOPIC_LEN: usize = 96;
pub const VALUE_SEPARATOR: &str = ", ";
/// Segment letters run `a..=z`.
pub const MAX_SEGMENTS: usize = 26;
const LOG_TIMESTAMP_FORMAT: &str = "%D %T";

pub type Topic = heapless::String<MAX_TOPIC_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("channel name exceeds 96 bytes")]
    TopicTooLong,
    #[error("segment {0} has no channel letter")]
    NoSegmentLetter(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Joined,
    Segmented,
}

impl PayloadEncoding {
    pub fn from_csv_flag(csv: bool) -> Self {
        if csv {
            PayloadEncoding::Joined
        } else {
            PayloadEncoding::Segmented
        }
    }
}

/// Builds `<tenant>/<zone>/<address>[/<letter>]` channel names.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    tenant: alloc::string::String,
    zone: alloc::string::String,
}

impl TopicBuilder {
    pub fn new(tenant: &str, zone: &str) -> Self {
        Self { tenant: tenant.into(), zone: zone.into() }
    }

    pub fn sensor(&self, address: SensorAddress) -> Result<Topic, TelemetryError> {
        let mut topic = Topic::new();
        write!(topic, "{}/{}/{}", self.tenant, self.zone, address).map_err(|_| TelemetryError::TopicTooLong)?;
        Ok(topic)
    }

    pub fn segment(&self, address: SensorAddress, index: usize) -> Result<Topic, TelemetryError> {
        let letter = segment_letter(index).ok_or(TelemetryError::NoSegmentLetter(index))?;
        let mut topic = self.sensor(address)?;
        write!(topic, "/{}", letter).map_err(|_| TelemetryError::TopicTooLong)?;
        Ok(topic)
    }
}

fn segment_letter(index: usize) -> Option<char> {
    let offset = u8::try_from(index).ok().filter(|&i| usize::from(i) < MAX_SEGMENTS)?;
    Some((b'a' + offset) as char)
}

/// Values joined with [`VALUE_SEPARATOR`], no trailing separator.
pub fn joined_payload(readings: &[Reading]) -> alloc::string::String {
    let mut payload = alloc::string::String::new();
    for (i, reading) in readings.iter().enumerate() {
        if i > 0 {
            payload.push_str(VALUE_SEPARATOR);
        }
        let _ = write!(payload, "{}", reading);
    }
    payload
}

/// `MM/DD/YY HH:MM:SS <address> <values>`; the timestamp is left out when
/// the wall clock is unknown.
pub fn log_line(batch: &ReadingBatch, unix_time: Option<i64>, utc_offset_s: i64) -> alloc::string::String {
    let values = joined_payload(&batch.readings);
    let stamp = unix_time
        .and_then(|t| chrono::DateTime::from_timestamp(t.saturating_add(utc_offset_s), 0))
        .map(|local| local.format(LOG_TIMESTAMP_FORMAT).to_string());
    match stamp {
        Some(stamp) => alloc::format!("{} {} {}", stamp, batch.address, values),
        None => alloc::format!("{} {}", batch.address, values),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishOutcome {
    Published { messages: usize, retried: bool },
    Dropped { published: usize, total: usize },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishStats {
    pub batches_published: u32,
    pub batches_dropped: u32,
    pub messages_published: u32,
    pub reconnects_triggered: u32,
}

#[derive(Debug)]
pub struct TelemetryPublisher {
    topics: TopicBuilder,
    stats: PublishStats,
}

impl TelemetryPublisher {
    pub fn new(topics: TopicBuilder) -> Self {
        Self { topics, stats: PublishStats::default() }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    pub fn stats(&self) -> &PublishStats {
        &self.stats
    }

    /// Channel/payload pairs for one batch under `encoding`.
    pub fn messages(
        &self,
        batch: &ReadingBatch,
        encoding: PayloadEncoding,
    ) -> Result<alloc::vec::Vec<(Topic, alloc::string::String)>, TelemetryError> {
        match encoding {
            PayloadEncoding::Joined => Ok(alloc::vec![(self.topics.sensor(batch.address)?, joined_payload(&batch.readings))]),
            PayloadEncoding::Segmented => batch
                .readings
                .iter()
                .enumerate()
                .map(|(i, reading)| self.topics.segment(batch.address, i).map(|topic| (topic, alloc::format!("{}", reading))))
                .collect(),
        }
    }

    /// Publish one batch. A failed publish triggers one reconnect, after which
    /// the remaining messages are tried once more before the batch is dropped.
    pub fn publish<M: BrokerTransport>(
        &mut self,
        link: &mut BrokerLink<M>,
        batch: &ReadingBatch,
        encoding: PayloadEncoding,
        now_ms: u64,
    ) -> PublishOutcome {
        let messages = match self.messages(batch, encoding) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(address = %batch.address, error = %e, "batch cannot be encoded; dropped");
                return self.dropped(0, batch.readings.len());
            }
        };

        let total = messages.len();
        let mut sent = 0;
        let mut retried = false;
        while sent < total {
            let (topic, payload) = &messages[sent];
            if link.publish(topic, payload) {
                debug!(topic = %topic, payload = %payload, "published");
                sent += 1;
                continue;
            }
            if retried {
                warn!(address = %batch.address, published = sent, total, "publish failed after reconnect; batch dropped");
                return self.dropped(sent, total);
            }
            if link.in_cooldown(now_ms) {
                warn!(address = %batch.address, "broker link in cooldown; batch dropped");
                return self.dropped(sent, total);
            }
            retried = true;
            self.stats.reconnects_triggered = self.stats.reconnects_triggered.saturating_add(1);
            info!(address = %batch.address, "publish failed; reconnecting");
            link.reconnect(now_ms);
        }

        self.stats.batches_published = self.stats.batches_published.saturating_add(1);
        self.stats.messages_published = self.stats.messages_published.saturating_add(total as u32);
        PublishOutcome::Published { messages: total, retried }
    }

    fn dropped(&mut self, published: usize, total: usize) -> PublishOutcome {
        self.stats.batches_dropped = self.stats.batches_dropped.saturating_add(1);
        self.stats.messages_published = self.stats.messages_published.saturating_add(published as u32);
        PublishOutcome::Dropped { published, total }
    }
}
