use crate::address::SensorAddress;
use crate::clock::Clock;
use crate::codec::{self, BusCommand, CodecError, InfoReply, MeasureReply, ReadingSet};
use crate::config::BusTiming;
use crate::ports::{BusTransport, TransportError};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const MAX_REPLY_LEN: usize = 128;

pub type ReplyBytes = Vec<u8, MAX_REPLY_LEN>;

/// Which component currently holds the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusOwner {
    Discovery,
    Measurement,
    AddressChange,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is busy: {0:?} in progress")]
    Busy(BusOwner),
    #[error("no reply from sensor '{0}'")]
    NoReply(SensorAddress),
    #[error("reply from sensor '{0}' overflowed the receive buffer")]
    Overflow(SensorAddress),
    #[error("bus transport: {0}")]
    Transport(#[from] TransportError),
    #[error("bus reply: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub commands_sent: u32,
    pub replies_received: u32,
    pub reply_timeouts: u32,
    pub transport_errors: u32,
}

/// One reply with its CR LF terminator removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    bytes: ReplyBytes,
}

impl Reply {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn text(&self) -> Result<&str, CodecError> {
        if !self.bytes.is_ascii() {
            return Err(CodecError::NonAscii);
        }
        core::str::from_utf8(&self.bytes).map_err(|_| CodecError::NonAscii)
    }
}

/// The shared sensor line, with bounded waits and a single-holder busy gate.
///
/// Every exchange clears stale input, sends one command and, where a reply is
/// expected, polls until the first byte arrives and then until the line falls
/// idle or a line feed arrives. Data replies get the reply timeout for their
/// first byte; every other command gets the shorter echo timeout.
pub struct SensorBus<T: BusTransport, C: Clock> {
    transport: T,
    clock: C,
    timing: BusTiming,
    holder: Option<BusOwner>,
    stats: BusStats,
}

impl<T: BusTransport, C: Clock> SensorBus<T, C> {
    pub fn new(transport: T, clock: C, timing: BusTiming) -> Self {
        Self {
            transport,
            clock,
            timing,
            holder: None,
            stats: BusStats::default(),
        }
    }

    pub fn into_parts(self) -> (T, C) {
        (self.transport, self.clock)
    }

    pub fn acquire(&mut self, owner: BusOwner) -> Result<(), BusError> {
        match self.holder {
            Some(holder) => Err(BusError::Busy(holder)),
            None => {
                self.holder = Some(owner);
                trace!(?owner, "bus acquired");
                Ok(())
            }
        }
    }

    pub fn release(&mut self, owner: BusOwner) {
        if self.holder == Some(owner) {
            self.holder = None;
            trace!(?owner, "bus released");
        } else {
            warn!(?owner, holder = ?self.holder, "release by non-holder ignored");
        }
    }

    pub fn is_busy(&self) -> bool {
        self.holder.is_some()
    }

    pub fn holder(&self) -> Option<BusOwner> {
        self.holder
    }

    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Acknowledge probe: any byte inside the presence window on any of the
    /// attempts means a sensor answers at `address`.
    pub fn probe(&mut self, address: SensorAddress) -> Result<bool, BusError> {
        for attempt in 1..=self.timing.presence_attempts {
            self.send(BusCommand::Acknowledge(address))?;
            let answered = self.wait_for_input(self.timing.presence_window_ms);
            self.transport.clear();
            if answered {
                debug!(%address, attempt, "sensor answered acknowledge");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn identify(&mut self, address: SensorAddress) -> Result<InfoReply, BusError> {
        let reply = self.transact(BusCommand::Identify(address))?;
        Ok(InfoReply::parse(reply.text()?, address)?)
    }

    pub fn start_measurement(&mut self, address: SensorAddress, concurrent: bool) -> Result<MeasureReply, BusError> {
        let reply = self.transact(BusCommand::Measure { address, concurrent })?;
        Ok(MeasureReply::parse(reply.text()?, address)?)
    }

    /// Issue `aD<index>!` and append the values it carries to `out`.
    pub fn retrieve(&mut self, address: SensorAddress, index: u8, out: &mut ReadingSet) -> Result<usize, BusError> {
        let reply = self.transact(BusCommand::Data { address, index })?;
        let (&echo, values) = reply
            .bytes()
            .split_first()
            .ok_or(CodecError::MalformedReply { expected: 1, actual: 0 })?;
        if echo != address.as_byte() {
            return Err(CodecError::AddressMismatch { expected: address.as_char(), actual: echo as char }.into());
        }
        Ok(codec::lex_values(values, out)?)
    }

    pub fn change_address(&mut self, from: SensorAddress, to: SensorAddress) -> Result<SensorAddress, BusError> {
        let reply = self.transact(BusCommand::ChangeAddress { from, to })?;
        Ok(codec::parse_address_echo(reply.text()?)?)
    }

    pub fn transact(&mut self, command: BusCommand) -> Result<Reply, BusError> {
        self.send(command)?;
        let timeout_ms = match command {
            BusCommand::Data { .. } => self.timing.reply_timeout_ms,
            _ => self.timing.echo_timeout_ms,
        };
        self.read_reply(command.address(), timeout_ms)
    }

    fn send(&mut self, command: BusCommand) -> Result<(), BusError> {
        self.transport.clear();
        let encoded = command.encode();
        if let Err(e) = self.transport.send(encoded.as_bytes()) {
            self.stats.transport_errors = self.stats.transport_errors.saturating_add(1);
            return Err(e.into());
        }
        self.stats.commands_sent = self.stats.commands_sent.saturating_add(1);
        trace!(command = %encoded, "bus command sent");
        Ok(())
    }

    fn wait_for_input(&mut self, window_ms: u64) -> bool {
        let deadline = self.clock.now_ms().saturating_add(window_ms);
        loop {
            if self.transport.available() > 0 {
                return true;
            }
            if self.clock.now_ms() >= deadline {
                return false;
            }
            self.clock.pause();
        }
    }

    fn read_reply(&mut self, address: SensorAddress, timeout_ms: u64) -> Result<Reply, BusError> {
        let first_byte_deadline = self.clock.now_ms().saturating_add(timeout_ms);
        let mut bytes = ReplyBytes::new();
        let mut last_byte_at: Option<u64> = None;

        loop {
            match self.transport.read() {
                Ok(b'\n') if last_byte_at.is_some() => break,
                Ok(byte) => {
                    last_byte_at = Some(self.clock.now_ms());
                    if byte == b'\r' || byte == b'\n' {
                        continue;
                    }
                    if bytes.push(byte).is_err() {
                        self.transport.clear();
                        return Err(BusError::Overflow(address));
                    }
                }
                Err(nb::Error::WouldBlock) => {
                    let now = self.clock.now_ms();
                    match last_byte_at {
                        None if now >= first_byte_deadline => {
                            self.stats.reply_timeouts = self.stats.reply_timeouts.saturating_add(1);
                            return Err(BusError::NoReply(address));
                        }
                        Some(at) if now.saturating_sub(at) >= self.timing.idle_gap_ms => break,
                        _ => self.clock.pause(),
                    }
                }
                Err(nb::Error::Other(e)) => {
                    self.stats.transport_errors = self.stats.transport_errors.saturating_add(1);
                    return Err(e.into());
                }
            }
        }

        self.stats.replies_received = self.stats.replies_received.saturating_add(1);
        Ok(Reply { bytes })
    }
}
