use crate::address::SensorAddress;
use crate::bus::{BusError, BusOwner, BusStats, SensorBus};
use crate::clock::Clock;
use crate::config::{ConfigFileError, LoggerConfig};
use crate::cycle::{CycleController, CycleEvent, CycleStats, ReadingBatch};
use crate::discovery::{DiscoveryReport, DiscoveryScan, ScanProgress};
use crate::link::{BrokerLink, LinkState};
use crate::ports::{BrokerTransport, BusTransport, InboundMessage, KeyValueStore, LogSink};
use crate::registry::{SensorRecord, SensorRegistry};
use crate::remote_config::{ConfigOutcome, ConfigStats, RemoteConfigChannel};
use crate::settings::{LiveSettings, SettingsStore};
use crate::telemetry::{self, PayloadEncoding, PublishOutcome, PublishStats, TelemetryPublisher, TopicBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error(transparent)]
    Config(#[from] ConfigFileError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggerStats {
    pub ticks: u64,
    pub cycles_completed: u32,
    pub batches_published: u32,
    pub batches_dropped: u32,
    pub publish_failures: u32,
    pub retries: u32,
    pub config_applied: u32,
    pub config_rejected: u32,
    pub discovery_passes: u32,
    pub address_changes: u32,
    pub sensors: usize,
    pub last_error: Option<alloc::string::String>,
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LoggerStatus {
    pub running: bool,
    pub discovering: bool,
    pub restart_requested: bool,
    pub network: LinkState,
    pub broker: LinkState,
    pub in_cooldown: bool,
    pub sensors: alloc::vec::Vec<SensorRecord>,
    pub settings: LiveSettings,
    pub stats: LoggerStats,
    pub bus: BusStats,
    pub cycle: CycleStats,
    pub publish: PublishStats,
    pub config: ConfigStats,
}

/// Parts handed back by [`DataLogger::into_parts`].
pub struct LoggerParts<T, M, S, L, C> {
    pub bus_transport: T,
    pub broker_transport: M,
    pub store: S,
    pub sink: L,
    pub clock: C,
}

/// The data logger: discovery, measurement cycles, telemetry and remote
/// configuration driven from one cooperative [`tick`](Self::tick).
pub struct DataLogger<T, M, S, L, C>
where
    T: BusTransport,
    M: BrokerTransport,
    S: KeyValueStore,
    L: LogSink,
    C: Clock,
{
    config: LoggerConfig,
    bus: SensorBus<T, C>,
    link: BrokerLink<M>,
    settings: SettingsStore<S>,
    sink: L,
    registry: SensorRegistry,
    scan: Option<DiscoveryScan>,
    rediscover_pending: bool,
    pending_address_change: Option<(SensorAddress, SensorAddress)>,
    cycle: CycleController,
    publisher: TelemetryPublisher,
    config_channel: RemoteConfigChannel,
    stats: LoggerStats,
    running: bool,
    restart_requested: bool,
}

impl<T, M, S, L, C> DataLogger<T, M, S, L, C>
where
    T: BusTransport,
    M: BrokerTransport,
    S: KeyValueStore,
    L: LogSink,
    C: Clock,
{
    pub fn new(config: LoggerConfig, bus_transport: T, broker_transport: M, store: S, sink: L, clock: C) -> Result<Self, LoggerError> {
        config.validate()?;
        let now = clock.now_ms();
        let link = BrokerLink::new(broker_transport, &config);
        let config_channel = RemoteConfigChannel::new(link.config_topic());
        Ok(Self {
            bus: SensorBus::new(bus_transport, clock, config.timing),
            link,
            settings: SettingsStore::load(store),
            sink,
            registry: SensorRegistry::empty(),
            scan: None,
            rediscover_pending: false,
            pending_address_change: None,
            cycle: CycleController::new(config.measure_mode, now),
            publisher: TelemetryPublisher::new(TopicBuilder::new(&config.tenant, &config.zone)),
            config_channel,
            stats: LoggerStats::default(),
            running: false,
            restart_requested: false,
            config,
        })
    }

    /// Boot: bring the links up and run the first discovery pass to the end,
/// servicing the link after every address.
    pub fn start(&mut self) -> Result<&SensorRegistry, LoggerError> {
        self.running = true;
        info!(
            tenant = %self.config.tenant,
            zone = %self.config.zone,
            device = %self.config.device_id,
            mode = ?self.config.measure_mode,
            "data logger starting"
        );
        self.link.service(self.bus.now_ms());
        // Scanning every address takes seconds; keep the session alive between steps.
        let mut scan = DiscoveryScan::begin(&mut self.bus)?;
        let report = loop {
            if let ScanProgress::Finished(report) = scan.step(&mut self.bus, &self.settings) {
                break report;
            }
            self.link.service(self.bus.now_ms());
        };
        self.install_registry(report);
        // First timed cycle falls one period after boot, not after construction.
        self.cycle = CycleController::new(self.config.measure_mode, self.bus.now_ms());
        Ok(&self.registry)
    }

    pub fn stop(&mut self) {
        self.running = false;
        info!("data logger stopping");
    }

    /// One loop iteration. Returns the cycle event this tick produced, if any.
    pub fn tick(&mut self) -> Result<Option<CycleEvent>, LoggerError> {
        if !self.running {
            return Ok(None);
        }
        self.stats.ticks = self.stats.ticks.saturating_add(1);

        self.link.service(self.bus.now_ms());
        self.drain_config();

        if let Some(scan) = self.scan.as_mut() {
            if let ScanProgress::Finished(report) = scan.step(&mut self.bus, &self.settings) {
                self.scan = None;
                self.install_registry(report);
            }
            return Ok(None);
        }

        if self.cycle.is_idle() && !self.bus.is_busy() {
            if let Some((from, to)) = self.pending_address_change.take() {
                self.change_address(from, to)?;
            }
            if self.rediscover_pending {
                self.rediscover_pending = false;
                self.scan = Some(DiscoveryScan::begin(&mut self.bus)?);
                return Ok(None);
            }
        }

        let period_ms = self.settings.live().period_ms();
        let event = self.cycle.tick(&mut self.bus, &self.registry, period_ms);
        if let Some(ref event) = event {
            self.handle_cycle_event(event);
        }
        Ok(event)
    }

    /// Start a measurement cycle as soon as the bus is free.
    pub fn trigger_cycle(&mut self) {
        self.cycle.trigger();
    }

    /// Schedule a discovery pass for the next tick with a free bus.
    pub fn request_rediscovery(&mut self) {
        self.rediscover_pending = true;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_discovering(&self) -> bool {
        self.scan.is_some()
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn pending_address_change(&self) -> Option<(SensorAddress, SensorAddress)> {
        self.pending_address_change
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SettingsStore<S> {
        &self.settings
    }

    pub fn bus(&self) -> &SensorBus<T, C> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SensorBus<T, C> {
        &mut self.bus
    }

    pub fn link(&self) -> &BrokerLink<M> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut BrokerLink<M> {
        &mut self.link
    }

    pub fn sink(&self) -> &L {
        &self.sink
    }

    pub fn cycle(&self) -> &CycleController {
        &self.cycle
    }

    pub fn publisher(&self) -> &TelemetryPublisher {
        &self.publisher
    }

    pub fn config_channel(&self) -> &RemoteConfigChannel {
        &self.config_channel
    }

    pub fn stats(&self) -> &LoggerStats {
        &self.stats
    }

    pub fn status(&self) -> LoggerStatus {
        let now = self.bus.now_ms();
        LoggerStatus {
            running: self.running,
            discovering: self.is_discovering(),
            restart_requested: self.restart_requested,
            network: self.link.network().state(),
            broker: self.link.broker().state(),
            in_cooldown: self.link.in_cooldown(now),
            sensors: self.registry.records().to_vec(),
            settings: self.settings.live().clone(),
            stats: self.stats.clone(),
            bus: *self.bus.stats(),
            cycle: *self.cycle.stats(),
            publish: *self.publisher.stats(),
            config: *self.config_channel.stats(),
        }
    }

    pub fn into_parts(self) -> LoggerParts<T, M, S, L, C> {
        let (bus_transport, clock) = self.bus.into_parts();
        LoggerParts {
            bus_transport,
            broker_transport: self.link.into_transport(),
            store: self.settings.into_store(),
            sink: self.sink,
            clock,
        }
    }

    fn drain_config(&mut self) {
        while let Some(message) = self.link.pop_inbound() {
            self.handle_config(&message);
        }
    }

    fn handle_config(&mut self, message: &InboundMessage) {
        match self.config_channel.handle(message, &mut self.settings) {
            ConfigOutcome::Applied { persisted } => {
                self.stats.config_applied = self.stats.config_applied.saturating_add(1);
                debug!(persisted, "setting applied");
            }
            ConfigOutcome::Rediscover { persisted } => {
                self.stats.config_applied = self.stats.config_applied.saturating_add(1);
                debug!(persisted, "value-set override stored; rediscovery scheduled");
                self.rediscover_pending = true;
            }
            ConfigOutcome::ChangeAddress { from, to } => {
                self.stats.config_applied = self.stats.config_applied.saturating_add(1);
                if let Some((old_from, old_to)) = self.pending_address_change.replace((from, to)) {
                    warn!(%old_from, %old_to, "pending address change superseded");
                }
                if self.bus.is_busy() {
                    info!(%from, %to, holder = ?self.bus.holder(), "address change deferred until bus is free");
                }
            }
            ConfigOutcome::Restart { persisted } => {
                self.stats.config_applied = self.stats.config_applied.saturating_add(1);
                debug!(persisted, "restart flagged");
                self.restart_requested = true;
            }
            ConfigOutcome::Ignored => {}
            ConfigOutcome::Rejected(e) => {
                self.stats.config_rejected = self.stats.config_rejected.saturating_add(1);
                self.stats.last_error = Some(alloc::format!("config: {}", e));
            }
        }
    }

    fn change_address(&mut self, from: SensorAddress, to: SensorAddress) -> Result<(), LoggerError> {
        if self.registry.contains(to) {
            warn!(%from, %to, "address change rejected: target address already in use");
            self.stats.config_rejected = self.stats.config_rejected.saturating_add(1);
            self.stats.last_error = Some(alloc::format!("address '{}' already in use", to));
            return Ok(());
        }
        if !self.registry.contains(from) {
            warn!(%from, "address change for unregistered sensor; attempting anyway");
        }

        self.bus.acquire(BusOwner::AddressChange)?;
        let result = self.bus.change_address(from, to);
        self.bus.release(BusOwner::AddressChange);

        match result {
            Ok(echoed) if echoed == to => {
                self.stats.address_changes = self.stats.address_changes.saturating_add(1);
                info!(%from, %to, "sensor address changed");
            }
            Ok(echoed) => warn!(%from, %to, %echoed, "sensor echoed an unexpected address"),
            Err(e) => {
                warn!(%from, %to, error = %e, "address change failed");
                self.stats.last_error = Some(alloc::format!("address change: {}", e));
            }
        }
        self.rediscover_pending = true;
        Ok(())
    }

    fn install_registry(&mut self, report: DiscoveryReport) {
        self.stats.discovery_passes = self.stats.discovery_passes.saturating_add(1);
        self.stats.sensors = report.registry.len();
        if report.transport_errors > 0 {
            self.stats.last_error = Some(alloc::format!("discovery: {} transport errors", report.transport_errors));
        }
        info!(
            sensors = report.registry.len(),
            probed = report.probed,
            identify_failures = report.identify_failures,
            duration_ms = report.duration_ms,
            "sensor registry updated"
        );
        self.registry = report.registry;
    }

    fn handle_cycle_event(&mut self, event: &CycleEvent) {
        match event {
            CycleEvent::Started { .. } => {}
            CycleEvent::Batch(batch) => {
                self.stats.retries = self.stats.retries.saturating_add(u32::from(batch.retries));
                self.dispatch(batch);
            }
            CycleEvent::Dropped { address, reason, attempts } => {
                self.stats.batches_dropped = self.stats.batches_dropped.saturating_add(1);
                self.stats.last_error = Some(alloc::format!("sensor '{}' dropped: {:?}", address, reason));
                debug!(%address, ?reason, attempts, "batch dropped by cycle");
            }
            CycleEvent::Completed(_) => {
                self.stats.cycles_completed = self.stats.cycles_completed.saturating_add(1);
            }
        }
    }

    fn dispatch(&mut self, batch: &ReadingBatch) {
        let live = self.settings.live();
        let encoding = PayloadEncoding::from_csv_flag(live.csv);
        let sd_logging = live.sd_logging;
        let utc_offset_s = live.utc_offset_s();
        let now = self.bus.now_ms();

        match self.publisher.publish(&mut self.link, batch, encoding, now) {
            PublishOutcome::Published { .. } => {
                self.stats.batches_published = self.stats.batches_published.saturating_add(1);
            }
            PublishOutcome::Dropped { published, total } => {
                self.stats.publish_failures = self.stats.publish_failures.saturating_add(1);
                self.stats.last_error = Some(alloc::format!("publish for '{}' failed", batch.address));
                error!(address = %batch.address, published, total, "telemetry batch lost");
            }
        }

        if sd_logging {
            let line = telemetry::log_line(batch, self.bus.clock().unix_time(), utc_offset_s);
            self.sink.append(&line);
        }
    }
}
