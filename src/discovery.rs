use crate::address::{SensorAddress, ADDRESS_SPACE};
use crate::bus::{BusError, BusOwner, SensorBus};
use crate::clock::Clock;
use crate::codec::InfoReply;
use crate::ports::{BusTransport, KeyValueStore};
use crate::registry::{SensorRecord, SensorRegistry};
use crate::settings::SettingsStore;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Models whose data-page count is known without configuration.
pub const KNOWN_MODELS: &[(&str, u8)] = &[("ATM41", 3), ("TER12", 1), ("GS3", 1)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSetSource {
    Override,
    KnownModel,
    Default,
}

/// Result of one step of a scan.
#[derive(Debug)]
pub enum ScanProgress {
    Probed { address: SensorAddress, present: bool },
    Finished(DiscoveryReport),
}

#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub registry: SensorRegistry,
    pub probed: usize,
    pub transport_errors: u32,
    pub identify_failures: u32,
    pub duration_ms: u64,
}

/// An address-space scan in progress.
///
/// Holds the bus for its whole lifetime and probes one address per
/// [`step`](Self::step), so the caller can keep servicing the broker link
/// between addresses. The registry it builds is only handed out once every
/// address has been probed.
#[derive(Debug)]
pub struct DiscoveryScan {
    next_rank: usize,
    found: Vec<SensorRecord, ADDRESS_SPACE>,
    transport_errors: u32,
    identify_failures: u32,
    started_at_ms: u64,
}

impl DiscoveryScan {
    pub fn begin<T: BusTransport, C: Clock>(bus: &mut SensorBus<T, C>) -> Result<Self, BusError> {
        bus.acquire(BusOwner::Discovery)?;
        info!("sensor discovery started");
        Ok(Self {
            next_rank: 0,
            found: Vec::new(),
            transport_errors: 0,
            identify_failures: 0,
            started_at_ms: bus.now_ms(),
        })
    }

    pub fn found(&self) -> &[SensorRecord] {
        &self.found
    }

    pub fn step<T, C, S>(&mut self, bus: &mut SensorBus<T, C>, settings: &SettingsStore<S>) -> ScanProgress
    where
        T: BusTransport,
        C: Clock,
        S: KeyValueStore,
    {
        let Some(address) = SensorAddress::from_rank(self.next_rank) else {
            return ScanProgress::Finished(self.finish(bus));
        };
        self.next_rank += 1;

        let present = match bus.probe(address) {
            Ok(present) => present,
            Err(e) => {
                self.transport_errors = self.transport_errors.saturating_add(1);
                warn!(%address, error = %e, "probe failed; treating address as empty");
                false
            }
        };

        if present {
            let record = self.identify(bus, settings, address);
            info!(%address, value_sets = record.value_sets, "sensor cached");
            // One record per address, so the scan can never exceed capacity.
            let _ = self.found.push(record);
        } else {
            debug!(%address, "no sensor");
        }

        ScanProgress::Probed { address, present }
    }

    /// Drive the scan to the end without yielding.
    pub fn run_to_completion<T, C, S>(
        bus: &mut SensorBus<T, C>,
        settings: &SettingsStore<S>,
    ) -> Result<DiscoveryReport, BusError>
    where
        T: BusTransport,
        C: Clock,
        S: KeyValueStore,
    {
        let mut scan = Self::begin(bus)?;
        loop {
            if let ScanProgress::Finished(report) = scan.step(bus, settings) {
                return Ok(report);
            }
        }
    }

    fn identify<T, C, S>(&mut self, bus: &mut SensorBus<T, C>, settings: &SettingsStore<S>, address: SensorAddress) -> SensorRecord
    where
        T: BusTransport,
        C: Clock,
        S: KeyValueStore,
    {
        match bus.identify(address) {
            Ok(info) => {
                let (value_sets, source) = resolve_value_sets(&info, settings);
                debug!(%address, model = %info.model, vendor = %info.vendor, ?source, "sensor identified");
                SensorRecord::new(address, value_sets).with_model(info.model_id())
            }
            Err(e) => {
                self.identify_failures = self.identify_failures.saturating_add(1);
                warn!(%address, error = %e, "identify failed; assuming a single data page");
                SensorRecord::new(address, 0)
            }
        }
    }

    fn finish<T: BusTransport, C: Clock>(&mut self, bus: &mut SensorBus<T, C>) -> DiscoveryReport {
        bus.release(BusOwner::Discovery);
        let records = core::mem::take(&mut self.found);
        // Scan order already matches registry order and addresses are unique.
        let registry = SensorRegistry::from_records(records).unwrap_or_default();
        info!(sensors = registry.len(), "sensor discovery finished");
        DiscoveryReport {
            registry,
            probed: self.next_rank,
            transport_errors: self.transport_errors,
            identify_failures: self.identify_failures,
            duration_ms: bus.now_ms().saturating_sub(self.started_at_ms),
        }
    }
}

/// Persisted override first, then the built-in model table, then 0.
pub fn resolve_value_sets<S: KeyValueStore>(info: &InfoReply, settings: &SettingsStore<S>) -> (u8, ValueSetSource) {
    let model = info.model_id();
    if let Some(count) = settings.value_set_override(&model) {
        return (count, ValueSetSource::Override);
    }
    if let Some(type_id) = info.sensor_type_id() {
        let mut key = heapless::String::<8>::new();
        if core::fmt::Write::write_fmt(&mut key, format_args!("{}", type_id)).is_ok() {
            if let Some(count) = settings.value_set_override(&key) {
                return (count, ValueSetSource::Override);
            }
        }
    }
    KNOWN_MODELS
        .iter()
        .find(|(known, _)| *known == model.as_str())
        .map_or((0, ValueSetSource::Default), |&(_, count)| (count, ValueSetSource::KnownModel))
}
