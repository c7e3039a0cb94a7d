//! Measurement cycle controller.
//!
//! One cycle walks every registered sensor through measure, wait and
//! retrieve. The controller never blocks: each [`CycleController::tick`] does
//! at most one bus exchange step and returns, so the caller keeps servicing
//! the broker link while a sensor is still converting.

use crate::address::{SensorAddress, ADDRESS_SPACE};
use crate::bus::{BusError, BusOwner, SensorBus};
use crate::clock::Clock;
use crate::codec::{CodecError, ReadingSet};
use crate::config::MeasureMode;
use crate::ports::BusTransport;
use crate::registry::{SensorRecord, SensorRegistry};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const MS_PER_SECOND: u64 = 1_000;

/// An issued measurement waiting for its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementJob {
    pub address: SensorAddress,
    pub response_count: u8,
    pub delay_s: u16,
    pub value_sets: u8,
    pub issued_at_ms: u64,
}

impl MeasurementJob {
    pub fn ready_at_ms(&self) -> u64 {
        self.issued_at_ms.saturating_add(u64::from(self.delay_s) * MS_PER_SECOND)
    }

    fn pages(&self) -> u8 {
        self.value_sets.max(1)
    }
}

/// Validated readings of one sensor for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingBatch {
    pub address: SensorAddress,
    pub readings: ReadingSet,
    pub taken_at_ms: u64,
    /// Failed retrieve attempts before this one succeeded.
    pub retries: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    MeasureFailed,
    NoValuesDeclared,
    RetriesExhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub sensors: u8,
    pub batches: u8,
    pub drops: u8,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    Started { sensors: usize },
    Batch(ReadingBatch),
    Dropped { address: SensorAddress, reason: DropReason, attempts: u8 },
    Completed(CycleSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub cycles_completed: u32,
    pub batches: u32,
    pub drops: u32,
    pub retries: u32,
    pub last_cycle: Option<CycleSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Measuring { cursor: usize, group_end: usize },
    Awaiting { deadline_ms: u64, group_end: usize },
    Retrieving { job: usize, attempt: u8, group_end: usize },
}

#[derive(Debug)]
pub struct CycleController {
    mode: MeasureMode,
    phase: Phase,
    armed_at_ms: u64,
    triggered: bool,
    sensors: Vec<SensorRecord, ADDRESS_SPACE>,
    jobs: Vec<MeasurementJob, ADDRESS_SPACE>,
    summary: CycleSummary,
    stats: CycleStats,
}

impl CycleController {
    pub fn new(mode: MeasureMode, now_ms: u64) -> Self {
        Self {
            mode,
            phase: Phase::Idle,
            armed_at_ms: now_ms,
            triggered: false,
            sensors: Vec::new(),
            jobs: Vec::new(),
            summary: CycleSummary::default(),
            stats: CycleStats::default(),
        }
    }

    pub fn mode(&self) -> MeasureMode {
        self.mode
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Start a cycle at the next idle tick regardless of the interval.
    pub fn trigger(&mut self) {
        self.triggered = true;
    }

    /// When the next timed cycle falls due under `period_ms`.
    pub fn next_due_ms(&self, period_ms: u64) -> u64 {
        self.armed_at_ms.saturating_add(period_ms)
    }

    pub fn pending_jobs(&self) -> &[MeasurementJob] {
        &self.jobs
    }

    /// Advance the cycle by one step.
    ///
    /// `period_ms` is read by the caller from the live settings on every
    /// tick, so an interval change takes effect for the cycle being armed.
    pub fn tick<T, C>(&mut self, bus: &mut SensorBus<T, C>, registry: &SensorRegistry, period_ms: u64) -> Option<CycleEvent>
    where
        T: BusTransport,
        C: Clock,
    {
        match self.phase {
            Phase::Idle => self.try_start(bus, registry, period_ms),
            Phase::Measuring { cursor, group_end } => self.measure(bus, cursor, group_end),
            Phase::Awaiting { deadline_ms, group_end } => {
                if bus.now_ms() >= deadline_ms {
                    self.phase = Phase::Retrieving { job: 0, attempt: 0, group_end };
                }
                None
            }
            Phase::Retrieving { job, attempt, group_end } => self.retrieve(bus, job, attempt, group_end),
        }
    }

    fn try_start<T: BusTransport, C: Clock>(
        &mut self,
        bus: &mut SensorBus<T, C>,
        registry: &SensorRegistry,
        period_ms: u64,
    ) -> Option<CycleEvent> {
        let now = bus.now_ms();
        if !self.triggered && now < self.next_due_ms(period_ms) {
            return None;
        }
        if registry.is_empty() {
            debug!("no sensors registered; cycle skipped");
            self.rearm(now);
            return None;
        }
        if let Err(e) = bus.acquire(BusOwner::Measurement) {
            debug!(error = %e, "cycle deferred");
            return None;
        }

        self.triggered = false;
        self.sensors = registry.snapshot();
        self.jobs.clear();
        self.summary = CycleSummary {
            started_at_ms: now,
            sensors: self.sensors.len() as u8,
            ..CycleSummary::default()
        };
        self.phase = Phase::Measuring { cursor: 0, group_end: self.group_end(0) };
        info!(sensors = self.sensors.len(), mode = ?self.mode, "measurement cycle started");
        Some(CycleEvent::Started { sensors: self.sensors.len() })
    }

    fn group_end(&self, start: usize) -> usize {
        if self.mode.is_concurrent() {
            self.sensors.len()
        } else {
            (start + 1).min(self.sensors.len())
        }
    }

    fn measure<T: BusTransport, C: Clock>(&mut self, bus: &mut SensorBus<T, C>, cursor: usize, group_end: usize) -> Option<CycleEvent> {
        let record = self.sensors[cursor].clone();
        let event = match bus.start_measurement(record.address, self.mode.is_concurrent()) {
            Ok(reply) if reply.response_count == 0 => {
                warn!(address = %record.address, "sensor declared no values");
                Some(self.drop_sensor(record.address, DropReason::NoValuesDeclared, 1))
            }
            Ok(reply) => {
                let job = MeasurementJob {
                    address: record.address,
                    response_count: reply.response_count,
                    delay_s: reply.delay_s,
                    value_sets: record.value_sets,
                    issued_at_ms: bus.now_ms(),
                };
                debug!(address = %job.address, delay_s = job.delay_s, values = job.response_count, "measurement issued");
                // The group never holds more jobs than the snapshot has sensors.
                let _ = self.jobs.push(job);
                None
            }
            Err(e) => {
                warn!(address = %record.address, error = %e, "measure command failed");
                Some(self.drop_sensor(record.address, DropReason::MeasureFailed, 1))
            }
        };

        let cursor = cursor + 1;
        self.phase = if cursor < group_end {
            Phase::Measuring { cursor, group_end }
        } else if let Some(deadline_ms) = self.jobs.iter().map(MeasurementJob::ready_at_ms).max() {
            debug!(deadline_ms, jobs = self.jobs.len(), "awaiting conversion");
            Phase::Awaiting { deadline_ms, group_end }
        } else {
            // Whole group dropped; move on without waiting.
            return match event {
                Some(event) => {
                    self.phase = Phase::Retrieving { job: 0, attempt: 0, group_end };
                    Some(event)
                }
                None => self.next_group(bus, group_end),
            };
        };
        event
    }

    fn retrieve<T: BusTransport, C: Clock>(
        &mut self,
        bus: &mut SensorBus<T, C>,
        index: usize,
        attempt: u8,
        group_end: usize,
    ) -> Option<CycleEvent> {
        let Some(job) = self.jobs.get(index).copied() else {
            return self.next_group(bus, group_end);
        };

        let budget = bus.timing().retrieve_attempts.max(1);
        match read_pages(bus, &job) {
            Ok(readings) => {
                self.phase = Phase::Retrieving { job: index + 1, attempt: 0, group_end };
                self.summary.batches = self.summary.batches.saturating_add(1);
                self.summary.retries = self.summary.retries.saturating_add(u32::from(attempt));
                self.stats.batches = self.stats.batches.saturating_add(1);
                self.stats.retries = self.stats.retries.saturating_add(u32::from(attempt));
                if attempt > 0 {
                    info!(address = %job.address, retries = attempt, "retrieve succeeded after retries");
                }
                Some(CycleEvent::Batch(ReadingBatch {
                    address: job.address,
                    readings,
                    taken_at_ms: bus.now_ms(),
                    retries: attempt,
                }))
            }
            Err(e) => {
                let attempts = attempt.saturating_add(1);
                if attempts >= budget {
                    warn!(address = %job.address, attempts, error = %e, "retrieve budget exhausted; batch dropped");
                    self.phase = Phase::Retrieving { job: index + 1, attempt: 0, group_end };
                    Some(self.drop_sensor(job.address, DropReason::RetriesExhausted, attempts))
                } else {
                    debug!(address = %job.address, attempt = attempts, error = %e, "retrieve failed; retrying");
                    self.phase = Phase::Retrieving { job: index, attempt: attempts, group_end };
                    None
                }
            }
        }
    }

    fn next_group<T: BusTransport, C: Clock>(&mut self, bus: &mut SensorBus<T, C>, group_end: usize) -> Option<CycleEvent> {
        self.jobs.clear();
        if group_end < self.sensors.len() {
            self.phase = Phase::Measuring { cursor: group_end, group_end: self.group_end(group_end) };
            return None;
        }
        Some(self.complete(bus))
    }

    fn complete<T: BusTransport, C: Clock>(&mut self, bus: &mut SensorBus<T, C>) -> CycleEvent {
        let now = bus.now_ms();
        bus.release(BusOwner::Measurement);
        self.summary.finished_at_ms = now;
        self.stats.cycles_completed = self.stats.cycles_completed.saturating_add(1);
        self.stats.last_cycle = Some(self.summary);
        self.sensors.clear();
        self.rearm(now);
        info!(
            batches = self.summary.batches,
            drops = self.summary.drops,
            duration_ms = now.saturating_sub(self.summary.started_at_ms),
            "measurement cycle completed"
        );
        CycleEvent::Completed(self.summary)
    }

    fn rearm(&mut self, now_ms: u64) {
        self.phase = Phase::Idle;
        self.triggered = false;
        self.armed_at_ms = now_ms;
    }

    fn drop_sensor(&mut self, address: SensorAddress, reason: DropReason, attempts: u8) -> CycleEvent {
        self.summary.drops = self.summary.drops.saturating_add(1);
        self.stats.drops = self.stats.drops.saturating_add(1);
        CycleEvent::Dropped { address, reason, attempts }
    }
}

/// Read `D0..D(k-1)` and check the total against the declared count.
fn read_pages<T: BusTransport, C: Clock>(bus: &mut SensorBus<T, C>, job: &MeasurementJob) -> Result<ReadingSet, BusError> {
    let mut readings = ReadingSet::new();
    for page in 0..job.pages() {
        bus.retrieve(job.address, page, &mut readings)?;
    }
    if readings.len() != usize::from(job.response_count) {
        return Err(CodecError::ShortRead { expected: job.response_count, actual: readings.len() }.into());
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_deadline_from_issue_time() {
        let job = MeasurementJob {
            address: SensorAddress::new('1').unwrap(),
            response_count: 2,
            delay_s: 2,
            value_sets: 0,
            issued_at_ms: 1_500,
        };
        assert_eq!(job.ready_at_ms(), 3_500);
        assert_eq!(job.pages(), 1);
    }

    #[test]
    fn test_timed_cycle_due_after_period() {
        let controller = CycleController::new(MeasureMode::Sequential, 10_000);
        assert_eq!(controller.next_due_ms(15_000), 25_000);
        assert!(controller.is_idle());
    }
}
