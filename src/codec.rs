//! Bus transcript codec.
//!
//! Builds the ASCII command strings sent to sensors and parses their
//! fixed-layout replies. Every command ends with the `!` sentinel; every reply
//! ends with CR LF, which callers strip before parsing.

use crate::address::SensorAddress;
use arrayvec::ArrayString;
use core::fmt::{self, Write};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const COMMAND_TERMINATOR: char = '!';
pub const MAX_COMMAND_SIZE: usize = 8;
/// Upper bound on values one sensor may declare for a single measurement.
pub const MAX_VALUES: usize = 99;
pub const MAX_MODEL_ID_LEN: usize = 16;
const MAX_LEXEME: usize = 24;

// Info reply layout: a ll cccccccc mmmmmm vvv xxx...
const INFO_VERSION: core::ops::Range<usize> = 1..3;
const INFO_VENDOR: core::ops::Range<usize> = 3..11;
const INFO_MODEL: core::ops::Range<usize> = 11..17;
const INFO_FIRMWARE: core::ops::Range<usize> = 17..20;
const MAX_SERIAL_LEN: usize = 13;

// Measure reply layout: a ttt n[n]
const MEASURE_DELAY: core::ops::Range<usize> = 1..4;
const MEASURE_MIN_LEN: usize = 5;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;
pub type ModelId = heapless::String<MAX_MODEL_ID_LEN>;
pub type ReadingSet = Vec<Reading, MAX_VALUES>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("reply too short: expected at least {expected} bytes, got {actual}")]
    MalformedReply { expected: usize, actual: usize },
    #[error("reply echoed address '{actual}', expected '{expected}'")]
    AddressMismatch { expected: char, actual: char },
    #[error("non-numeric field '{0}' in reply")]
    InvalidField(alloc::string::String),
    #[error("reply contains non-ASCII bytes")]
    NonAscii,
    #[error("reply carries more than 99 values")]
    TooManyValues,
    #[error("read {actual} values, sensor declared {expected}")]
    ShortRead { expected: u8, actual: usize },
}

/// Command variants understood by the sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusCommand {
    Acknowledge(SensorAddress),
    Identify(SensorAddress),
    Measure { address: SensorAddress, concurrent: bool },
    Data { address: SensorAddress, index: u8 },
    ChangeAddress { from: SensorAddress, to: SensorAddress },
}

impl BusCommand {
    pub fn address(&self) -> SensorAddress {
        match *self {
            BusCommand::Acknowledge(address)
            | BusCommand::Identify(address)
            | BusCommand::Measure { address, .. }
            | BusCommand::Data { address, .. } => address,
            BusCommand::ChangeAddress { from, .. } => from,
        }
    }

    pub fn encode(&self) -> CommandBuffer {
        let mut buffer = CommandBuffer::new();
        // Longest command is "aD9!" / "aAb!"; index fits because data pages are 0..=9.
        let _ = write!(buffer, "{}", self);
        buffer
    }
}

impl fmt::Display for BusCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BusCommand::Acknowledge(address) => write!(f, "{}{}", address, COMMAND_TERMINATOR),
            BusCommand::Identify(address) => write!(f, "{}I{}", address, COMMAND_TERMINATOR),
            BusCommand::Measure { address, concurrent } => {
                let verb = if concurrent { 'C' } else { 'M' };
                write!(f, "{}{}{}", address, verb, COMMAND_TERMINATOR)
            }
            BusCommand::Data { address, index } => write!(f, "{}D{}{}", address, index, COMMAND_TERMINATOR),
            BusCommand::ChangeAddress { from, to } => write!(f, "{}A{}{}", from, to, COMMAND_TERMINATOR),
        }
    }
}

/// Reply to a measure command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureReply {
    pub address: SensorAddress,
    /// Seconds until data is ready. Never zero.
    pub delay_s: u16,
    pub response_count: u8,
}

impl MeasureReply {
    pub fn parse(reply: &str, expected: SensorAddress) -> Result<Self, CodecError> {
        let reply = reply.trim();
        if !reply.is_ascii() {
            return Err(CodecError::NonAscii);
        }
        if reply.len() < MEASURE_MIN_LEN {
            return Err(CodecError::MalformedReply { expected: MEASURE_MIN_LEN, actual: reply.len() });
        }

        let address = check_echo(reply, expected)?;
        let delay_s = parse_digits::<u16>(&reply[MEASURE_DELAY])?;
        let response_count = parse_digits::<u8>(&reply[MEASURE_DELAY.end..])?;
        if usize::from(response_count) > MAX_VALUES {
            return Err(CodecError::TooManyValues);
        }

        Ok(Self {
            address,
            delay_s: delay_s.max(1),
            response_count,
        })
    }
}

/// Reply to an identify command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoReply {
    pub address: SensorAddress,
    pub protocol_version: heapless::String<2>,
    pub vendor: heapless::String<8>,
    pub model: heapless::String<6>,
    pub firmware: heapless::String<3>,
    pub serial: heapless::String<MAX_SERIAL_LEN>,
}

impl InfoReply {
    pub fn parse(reply: &str, expected: SensorAddress) -> Result<Self, CodecError> {
        let reply = reply.trim_end();
        if !reply.is_ascii() {
            return Err(CodecError::NonAscii);
        }
        if reply.len() < INFO_MODEL.end {
            return Err(CodecError::MalformedReply { expected: INFO_MODEL.end, actual: reply.len() });
        }

        let address = check_echo(reply, expected)?;
        let firmware = reply.get(INFO_FIRMWARE).unwrap_or("");
        let serial = reply.get(INFO_FIRMWARE.end..).unwrap_or("");

        Ok(Self {
            address,
            protocol_version: bounded(&reply[INFO_VERSION]),
            vendor: bounded(reply[INFO_VENDOR].trim()),
            model: bounded(reply[INFO_MODEL].trim()),
            firmware: bounded(firmware.trim()),
            serial: bounded(serial.trim()),
        })
    }

    /// Key used for the static value-set table and persisted overrides.
    pub fn model_id(&self) -> ModelId {
        bounded(&self.model)
    }

    /// Numeric sensor-type id, when the model field is purely numeric.
    pub fn sensor_type_id(&self) -> Option<u16> {
        if !self.model.is_empty() && self.model.bytes().all(|b| b.is_ascii_digit()) {
            self.model.parse().ok()
        } else {
            None
        }
    }
}

/// Parse the echo of an address-change command, which is the new address.
pub fn parse_address_echo(reply: &str) -> Result<SensorAddress, CodecError> {
    let reply = reply.trim();
    let first = reply.chars().next().ok_or(CodecError::MalformedReply { expected: 1, actual: 0 })?;
    SensorAddress::new(first).map_err(|_| CodecError::InvalidField(alloc::string::ToString::to_string(reply)))
}

/// One numeric value as reported on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f32,
    /// Fractional digits the sensor used, so `7.0` is re-encoded as `7.0`.
    pub precision: u8,
}

impl Reading {
    pub fn new(value: f32, precision: u8) -> Self {
        Self { value, precision }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.*}", usize::from(self.precision), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Idle,
    InNumber,
    Delimiter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteClass {
    /// `+` or `-`: ends the previous value and begins a new one.
    Start,
    /// Digit or decimal point.
    Continue,
    Delimiter,
}

impl ByteClass {
    fn of(byte: u8) -> Self {
        match byte {
            b'+' | b'-' => ByteClass::Start,
            b'0'..=b'9' | b'.' => ByteClass::Continue,
            _ => ByteClass::Delimiter,
        }
    }
}

/// Lexer for data replies with sign characters acting as implicit delimiters.
///
/// `+1.5-2.25+3` yields `1.5`, `-2.25`, `3`. Runs that do not form a number
/// (a lone sign, a lone `.`, more than one `.`) are discarded.
#[derive(Debug)]
pub struct DataLexer {
    state: LexState,
    lexeme: heapless::String<MAX_LEXEME>,
    overflowed: bool,
}

impl DataLexer {
    pub fn new() -> Self {
        Self {
            state: LexState::Idle,
            lexeme: heapless::String::new(),
            overflowed: false,
        }
    }

    /// Feed one byte; returns a value when this byte terminated one.
    pub fn feed(&mut self, byte: u8) -> Option<Reading> {
        match (self.state, ByteClass::of(byte)) {
            (LexState::InNumber, ByteClass::Start) => {
                let finished = self.take();
                self.begin(byte);
                finished
            }
            (LexState::InNumber, ByteClass::Continue) => {
                self.push(byte);
                None
            }
            (LexState::InNumber, ByteClass::Delimiter) => {
                self.state = LexState::Delimiter;
                self.take()
            }
            (LexState::Idle | LexState::Delimiter, ByteClass::Start | ByteClass::Continue) => {
                self.begin(byte);
                None
            }
            (LexState::Idle | LexState::Delimiter, ByteClass::Delimiter) => {
                self.state = LexState::Delimiter;
                None
            }
        }
    }

    /// Flush a value still in progress at end of reply.
    pub fn finish(&mut self) -> Option<Reading> {
        let finished = if self.state == LexState::InNumber { self.take() } else { None };
        self.state = LexState::Idle;
        finished
    }

    fn begin(&mut self, byte: u8) {
        self.lexeme.clear();
        self.overflowed = false;
        self.state = LexState::InNumber;
        if byte != b'+' {
            self.push(byte);
        }
    }

    fn push(&mut self, byte: u8) {
        if self.lexeme.push(byte as char).is_err() {
            self.overflowed = true;
        }
    }

    fn take(&mut self) -> Option<Reading> {
        let reading = if self.overflowed { None } else { Self::interpret(&self.lexeme) };
        self.lexeme.clear();
        self.overflowed = false;
        reading
    }

    fn interpret(lexeme: &str) -> Option<Reading> {
        if !lexeme.bytes().any(|b| b.is_ascii_digit()) {
            return None;
        }
        let value = lexeme.parse::<f32>().ok()?;
        let precision = lexeme.find('.').map_or(0, |dot| lexeme.len() - dot - 1);
        Some(Reading::new(value, u8::try_from(precision).unwrap_or(u8::MAX)))
    }
}

impl Default for DataLexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lex every value in `bytes`, appending to `out`. Returns the number added.
pub fn lex_values(bytes: &[u8], out: &mut ReadingSet) -> Result<usize, CodecError> {
    let mut lexer = DataLexer::new();
    let before = out.len();
    for &byte in bytes {
        if let Some(reading) = lexer.feed(byte) {
            out.push(reading).map_err(|_| CodecError::TooManyValues)?;
        }
    }
    if let Some(reading) = lexer.finish() {
        out.push(reading).map_err(|_| CodecError::TooManyValues)?;
    }
    Ok(out.len() - before)
}

fn check_echo(reply: &str, expected: SensorAddress) -> Result<SensorAddress, CodecError> {
    let echoed = reply.as_bytes()[0] as char;
    if echoed != expected.as_char() {
        return Err(CodecError::AddressMismatch { expected: expected.as_char(), actual: echoed });
    }
    Ok(expected)
}

fn parse_digits<T: core::str::FromStr>(field: &str) -> Result<T, CodecError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::InvalidField(alloc::string::ToString::to_string(field)));
    }
    field.parse().map_err(|_| CodecError::InvalidField(alloc::string::ToString::to_string(field)))
}

fn bounded<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}
