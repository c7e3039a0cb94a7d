use crate::address::SensorAddress;
use crate::clock::Clock;
use crate::codec::Reading;
use crate::ports::{BusTransport, TransportError};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use serde::{Deserialize, Serialize};
use tracing::trace;

const REPLY_TERMINATOR: &str = "\r\n";

/// A scripted sensor on the simulated line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSensor {
    pub address: SensorAddress,
    pub vendor: String,
    pub model: String,
    pub firmware: String,
    pub serial: String,
    pub delay_s: u16,
    pub values: Vec<Reading>,
    /// Data pages the values are spread over.
    pub pages: u8,
    /// Acknowledge commands ignored before the sensor starts answering.
    pub silent_probes: u32,
    /// Retrieve attempts answered with no values.
    pub short_reads: u32,
    /// Never answer the identify command.
    pub silent_info: bool,
    /// Peak random-walk step applied to every value per measurement.
    pub drift: f32,
    #[serde(skip)]
    ready_at_ms: Option<u64>,
    #[serde(skip)]
    short_attempt: bool,
}

impl SimSensor {
    pub fn new(address: SensorAddress, model: &str) -> Self {
        Self {
            address,
            vendor: "SIMULATE".into(),
            model: model.into(),
            firmware: "100".into(),
            serial: String::new(),
            delay_s: 1,
            values: Vec::new(),
            pages: 1,
            silent_probes: 0,
            short_reads: 0,
            silent_info: false,
            drift: 0.0,
            ready_at_ms: None,
            short_attempt: false,
        }
    }

    pub fn with_values(mut self, values: &[(f32, u8)]) -> Self {
        self.values = values.iter().map(|&(value, precision)| Reading::new(value, precision)).collect();
        self
    }

    pub fn with_delay(mut self, delay_s: u16) -> Self {
        self.delay_s = delay_s;
        self
    }

    pub fn with_pages(mut self, pages: u8) -> Self {
        self.pages = pages.max(1);
        self
    }

    pub fn with_silent_probes(mut self, silent_probes: u32) -> Self {
        self.silent_probes = silent_probes;
        self
    }

    pub fn with_short_reads(mut self, short_reads: u32) -> Self {
        self.short_reads = short_reads;
        self
    }

    pub fn without_info(mut self) -> Self {
        self.silent_info = true;
        self
    }

    pub fn with_drift(mut self, drift: f32) -> Self {
        self.drift = drift;
        self
    }

    fn info_reply(&self) -> String {
        alloc::format!(
            "{}14{:<8.8}{:<6.6}{:<3.3}{}",
            self.address,
            self.vendor,
            self.model,
            self.firmware,
            self.serial
        )
    }

    fn page(&self, index: u8) -> &[Reading] {
        let pages = usize::from(self.pages.max(1));
        let per_page = self.values.len().div_ceil(pages).max(1);
        let start = usize::from(index) * per_page;
        if index >= self.pages || start >= self.values.len() {
            return &[];
        }
        &self.values[start..(start + per_page).min(self.values.len())]
    }
}

/// One command seen on the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub at_ms: u64,
    pub command: String,
}

/// Half-duplex line with scripted sensors. Replies are buffered the moment a
/// command is sent.
#[derive(Debug)]
pub struct SimulatedBus<C: Clock> {
    clock: C,
    sensors: Vec<SimSensor>,
    rx: VecDeque<u8>,
    transcript: Vec<TranscriptEntry>,
    line_down: bool,
    rng_state: u64,
}

impl<C: Clock> SimulatedBus<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            sensors: Vec::new(),
            rx: VecDeque::new(),
            transcript: Vec::new(),
            line_down: false,
            rng_state: 0x1234_5678_9ABC_DEF0,
        }
    }

    pub fn with_sensor(mut self, sensor: SimSensor) -> Self {
        self.add_sensor(sensor);
        self
    }

    pub fn add_sensor(&mut self, sensor: SimSensor) {
        self.sensors.retain(|existing| existing.address != sensor.address);
        self.sensors.push(sensor);
    }

    pub fn sensor(&self, address: SensorAddress) -> Option<&SimSensor> {
        self.sensors.iter().find(|sensor| sensor.address == address)
    }

    pub fn sensor_mut(&mut self, address: SensorAddress) -> Option<&mut SimSensor> {
        self.sensors.iter_mut().find(|sensor| sensor.address == address)
    }

    pub fn sensors(&self) -> &[SimSensor] {
        &self.sensors
    }

    pub fn set_line_down(&mut self, down: bool) {
        self.line_down = down;
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn clear_transcript(&mut self) {
        self.transcript.clear();
    }

    /// Commands sent that match `command` exactly.
    pub fn count(&self, command: &str) -> usize {
        self.transcript.iter().filter(|entry| entry.command == command).count()
    }

    pub fn first_sent_at(&self, command: &str) -> Option<u64> {
        self.transcript.iter().find(|entry| entry.command == command).map(|entry| entry.at_ms)
    }

    fn respond(&mut self, command: &str) {
        let mut chars = command.chars();
        let Some(address) = chars.next().and_then(|c| SensorAddress::new(c).ok()) else {
            return;
        };
        let body: String = chars.collect();
        let now = self.clock.now_ms();
        let noise = self.next_noise();

        let Some(sensor) = self.sensors.iter_mut().find(|sensor| sensor.address == address) else {
            return;
        };

        let reply = match body.as_str() {
            "!" => {
                if sensor.silent_probes > 0 {
                    sensor.silent_probes -= 1;
                    return;
                }
                alloc::format!("{}", address)
            }
            "I!" if sensor.silent_info => return,
            "I!" => sensor.info_reply(),
            "M!" | "C!" => {
                sensor.ready_at_ms = Some(now.saturating_add(u64::from(sensor.delay_s) * 1_000));
                if sensor.drift != 0.0 {
                    let step = sensor.drift * noise;
                    for reading in &mut sensor.values {
                        reading.value += step;
                    }
                }
                if body.starts_with('C') {
                    alloc::format!("{}{:03}{:02}", address, sensor.delay_s, sensor.values.len())
                } else {
                    alloc::format!("{}{:03}{}", address, sensor.delay_s, sensor.values.len())
                }
            }
            _ if body.starts_with('D') && body.ends_with('!') => {
                let index = body[1..body.len() - 1].parse::<u8>().unwrap_or(u8::MAX);
                if index == 0 {
                    sensor.short_attempt = sensor.short_reads > 0;
                    if sensor.short_attempt {
                        sensor.short_reads -= 1;
                    }
                }
                let ready = sensor.ready_at_ms.is_some_and(|at| now >= at);
                let mut reply = alloc::format!("{}", address);
                if ready && !sensor.short_attempt {
                    for reading in sensor.page(index) {
                        let _ = write!(reply, "{:+.*}", usize::from(reading.precision), reading.value);
                    }
                }
                reply
            }
            _ if body.starts_with('A') && body.ends_with('!') && body.len() == 3 => {
                let Some(to) = body[1..2].chars().next().and_then(|c| SensorAddress::new(c).ok()) else {
                    return;
                };
                sensor.address = to;
                alloc::format!("{}", to)
            }
            _ => return,
        };

        trace!(command, reply = %reply, "simulated reply");
        self.rx.extend(reply.bytes());
        self.rx.extend(REPLY_TERMINATOR.bytes());
    }

    /// Uniform noise in `-1.0..1.0` from a fixed-seed LCG.
    fn next_noise(&mut self) -> f32 {
        self.rng_state = self.rng_state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let sample = (self.rng_state >> 40) as u32 & 0xFFFF;
        (sample as f32 / 32_768.0) - 1.0
    }
}

impl<C: Clock> BusTransport for SimulatedBus<C> {
    fn send(&mut self, command: &[u8]) -> Result<(), TransportError> {
        if self.line_down {
            return Err(TransportError::LineDown);
        }
        let command = core::str::from_utf8(command).map_err(|_| TransportError::SendFailed("non-UTF-8 command".into()))?;
        self.transcript.push(TranscriptEntry {
            at_ms: self.clock.now_ms(),
            command: command.into(),
        });
        self.respond(command);
        Ok(())
    }

    fn read(&mut self) -> nb::Result<u8, TransportError> {
        if self.line_down {
            return Err(nb::Error::Other(TransportError::LineDown));
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn available(&self) -> usize {
        self.rx.len()
    }

    fn clear(&mut self) {
        self.rx.clear();
    }
}
