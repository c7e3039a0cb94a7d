//! # sdilog
//!
//! Core of an unattended field data logger. It discovers sensors on a shared
//! SDI-12 style bus, runs timed measurement cycles, republishes readings to a
//! telemetry broker and applies configuration commands received from it.
//!
//! ## Features
//!
//! - **Sensor discovery**: incremental scan of the 62-address space with
//!   presence retries and value-set resolution
//! - **Measurement cycles**: sequential (`aM!`) or concurrent (`aC!`)
//!   measure/wait/retrieve with a bounded retry budget per sensor
//! - **Telemetry**: joined or per-value channels, reconnect-and-retry publish,
//!   local log lines
//! - **Remote configuration**: `+`-delimited command table with persisted,
//!   write-through settings
//! - **Connectivity supervision**: retry budget, backoff, give-up and cooldown
//!   for the network and broker links
//! - **Embedded-friendly**: single cooperative loop, bounded buffers, no
//!   blocking waits outside short bus polls
//!
//! ## Quick Start
//!
//! ```rust
//! use sdilog::address::SensorAddress;
//! use sdilog::clock::ManualClock;
//! use sdilog::config::LoggerConfig;
//! use sdilog::sim::{MemorySink, MemoryStore, ScriptedBroker, SimSensor, SimulatedBus};
//! use sdilog::DataLogger;
//!
//! let clock = ManualClock::new();
//! let sensor = SimSensor::new(SensorAddress::new('1').unwrap(), "TER12").with_values(&[(21.5, 1)]);
//! let bus = SimulatedBus::new(clock.clone()).with_sensor(sensor);
//!
//! let mut logger = DataLogger::new(
//!     LoggerConfig::default(),
//!     bus,
//!     ScriptedBroker::online(),
//!     MemoryStore::new(),
//!     MemorySink::new(),
//!     clock.clone(),
//! )
//! .unwrap();
//!
//! assert_eq!(logger.start().unwrap().len(), 1);
//! logger.trigger_cycle();
//! for _ in 0..10 {
//!     logger.tick().unwrap();
//!     clock.advance(250);
//! }
//! assert_eq!(logger.stats().batches_published, 1);
//! ```
//!
//! ## Architecture
//!
//! - [`ports`] and [`clock`] - collaborator traits
//! - [`config`] - static deployment configuration
//! - [`address`] - sensor address type and scan order
//! - [`codec`] - bus command and reply formats
//! - [`bus`] - bounded bus exchanges and the busy gate
//! - [`registry`] - discovered sensors
//! - [`discovery`] - address-space scan
//! - [`cycle`] - measurement cycle state machine
//! - [`telemetry`] - channel names, payloads, publishing
//! - [`link`] - network and broker link supervision
//! - [`settings`] - live settings with write-through persistence
//! - [`remote_config`] - configuration command decoding
//! - [`logger`] - the orchestrator
//! - [`sim`] - in-memory collaborators

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

pub mod address;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod cycle;
pub mod discovery;
pub mod link;
pub mod logger;
pub mod ports;
pub mod registry;
pub mod remote_config;
pub mod settings;
pub mod sim;
pub mod telemetry;

pub use address::SensorAddress;
pub use config::LoggerConfig;
pub use logger::{DataLogger, LoggerError};
pub use registry::SensorRegistry;
