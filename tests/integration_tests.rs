use sdilog::address::SensorAddress;
use sdilog::clock::{Clock, ManualClock};
use sdilog::config::LoggerConfig;
use sdilog::cycle::CycleEvent;
use sdilog::settings::KEY_PERIOD;
use sdilog::sim::{MemorySink, MemoryStore, ScriptedBroker, SimSensor, SimulatedBus, StoredValue};
use sdilog::DataLogger;

const CONFIG_TOPIC: &str = "tenant/logger/config";
const TICK_MS: u64 = 100;

type TestLogger = DataLogger<SimulatedBus<ManualClock>, ScriptedBroker, MemoryStore, MemorySink, ManualClock>;

fn addr(c: char) -> SensorAddress {
    SensorAddress::new(c).unwrap()
}

fn config() -> LoggerConfig {
    LoggerConfig {
        zone: "zone".into(),
        ..LoggerConfig::default()
    }
}

fn field_sensor() -> SimSensor {
    SimSensor::new(addr('1'), "NOVEL").with_values(&[(12.3, 1), (-4.5, 1)]).with_delay(2)
}

fn logger_with(sensors: Vec<SimSensor>, broker: ScriptedBroker) -> (TestLogger, ManualClock) {
    let clock = ManualClock::new();
    let mut bus = SimulatedBus::new(clock.clone());
    for sensor in sensors {
        bus.add_sensor(sensor);
    }
    let mut logger = DataLogger::new(config(), bus, broker, MemoryStore::new(), MemorySink::new(), clock.clone()).unwrap();
    logger.start().unwrap();
    (logger, clock)
}

fn deliver(logger: &mut TestLogger, payload: &str) {
    logger.link_mut().transport_mut().deliver(CONFIG_TOPIC, payload);
}

/// Tick until `done` holds; returns every cycle event seen.
fn run_until(logger: &mut TestLogger, clock: &ManualClock, done: impl Fn(&TestLogger) -> bool) -> Vec<CycleEvent> {
    let mut events = Vec::new();
    for _ in 0..2_000 {
        if let Some(event) = logger.tick().unwrap() {
            events.push(event);
        }
        if done(logger) {
            return events;
        }
        clock.advance(TICK_MS);
    }
    panic!("condition not reached; events: {:?}", events);
}

fn transcript_position(logger: &TestLogger, command: &str) -> Option<usize> {
    logger.bus().transport().transcript().iter().position(|entry| entry.command == command)
}

#[test]
fn test_boot_discovers_sensor() {
    let (logger, _clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    assert!(logger.is_running());
    assert_eq!(logger.registry().len(), 1);
    assert!(logger.registry().contains(addr('1')));
    assert_eq!(logger.stats().discovery_passes, 1);
    assert_eq!(logger.link().transport().subscriptions(), [CONFIG_TOPIC]);
}

#[test]
fn test_link_serviced_throughout_boot_scan() {
    let (logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::new().failing_connects(1));

    // The first connect fails at boot; the retry falls due mid-scan
    assert!(clock.now_ms() > 5_000);
    assert!(logger.link().is_connected());
    assert_eq!(logger.link().transport().connect_attempts, 2);
    assert!(logger.link().transport().service_calls >= 63);
    assert!(logger.link().is_subscribed());
}

#[test]
fn test_end_to_end_publish() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    logger.trigger_cycle();
    let events = run_until(&mut logger, &clock, |l| l.stats().cycles_completed == 1);

    assert!(matches!(events.first(), Some(CycleEvent::Started { sensors: 1 })));
    let published = logger.link().transport().published();
    assert_eq!(published, [("tenant/zone/1".to_string(), "12.3, -4.5".to_string())]);
    assert_eq!(logger.stats().batches_published, 1);

    // No data request before the declared two seconds have passed
    let sim = logger.bus().transport();
    let measured = sim.first_sent_at("1C!").unwrap();
    assert!(sim.first_sent_at("1D0!").unwrap() >= measured + 2_000);
}

#[test]
fn test_segmented_publish_after_csv_disabled() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    deliver(&mut logger, "0+false");
    logger.trigger_cycle();
    run_until(&mut logger, &clock, |l| l.stats().cycles_completed == 1);

    let topics: Vec<&str> = logger.link().transport().published().iter().map(|(topic, _)| topic.as_str()).collect();
    assert_eq!(topics, ["tenant/zone/1/a", "tenant/zone/1/b"]);
}

#[test]
fn test_sd_log_line_written() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    logger.trigger_cycle();
    run_until(&mut logger, &clock, |l| l.stats().cycles_completed == 1);
    assert_eq!(logger.sink().lines(), ["1 12.3, -4.5"]);

    clock.set_unix_time(1_700_000_000);
    logger.trigger_cycle();
    run_until(&mut logger, &clock, |l| l.stats().cycles_completed == 2);
    let stamped = &logger.sink().lines()[1];
    assert!(stamped.starts_with("11/14/23 "), "{}", stamped);
    assert!(stamped.ends_with(" 1 12.3, -4.5"), "{}", stamped);
}

#[test]
fn test_sd_logging_disabled_writes_nothing() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    deliver(&mut logger, "4+false");
    logger.tick().unwrap();
    assert!(logger.restart_requested());
    assert!(!logger.settings().live().sd_logging);

    logger.trigger_cycle();
    run_until(&mut logger, &clock, |l| l.stats().cycles_completed == 1);
    assert!(logger.sink().lines().is_empty());
}

#[test]
fn test_timed_cycle_follows_interval() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());
    let booted_at = clock.now_ms();

    deliver(&mut logger, "1+60");
    assert_eq!(logger.tick().unwrap(), None);
    assert_eq!(logger.settings().live().period_us, 60_000_000);
    assert_eq!(logger.settings().store().value(KEY_PERIOD), Some(StoredValue::U64(60_000_000)));

    clock.set(booted_at + 15_000);
    assert_eq!(logger.tick().unwrap(), None);

    clock.set(booted_at + 60_000);
    assert_eq!(logger.tick().unwrap(), Some(CycleEvent::Started { sensors: 1 }));
}

#[test]
fn test_address_change_then_rediscovery() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    deliver(&mut logger, "2+1+7");
    run_until(&mut logger, &clock, |l| l.stats().discovery_passes == 2);

    assert_eq!(logger.stats().address_changes, 1);
    assert!(logger.registry().contains(addr('7')));
    assert!(!logger.registry().contains(addr('1')));
    assert!(!logger.bus().is_busy());
}

#[test]
fn test_address_change_waits_for_cycle() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    logger.trigger_cycle();
    run_until(&mut logger, &clock, |l| !l.cycle().is_idle());
    deliver(&mut logger, "2+1+7");
    run_until(&mut logger, &clock, |l| l.stats().discovery_passes == 2);

    let data_at = transcript_position(&logger, "1D0!").unwrap();
    let change_at = transcript_position(&logger, "1A7!").unwrap();
    assert!(data_at < change_at);
    assert_eq!(logger.stats().batches_published, 1);
    assert!(logger.registry().contains(addr('7')));
}

#[test]
fn test_address_change_to_taken_address_rejected() {
    let (mut logger, clock) = logger_with(
        vec![field_sensor(), SimSensor::new(addr('7'), "GS3").with_values(&[(1.0, 1)])],
        ScriptedBroker::online(),
    );

    deliver(&mut logger, "2+1+7");
    logger.tick().unwrap();
    clock.advance(TICK_MS);
    logger.tick().unwrap();

    assert!(transcript_position(&logger, "1A7!").is_none());
    assert_eq!(logger.stats().config_rejected, 1);
    assert!(!logger.is_discovering());
    assert_eq!(logger.registry().len(), 2);
}

#[test]
fn test_value_set_override_rediscovers() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());
    assert_eq!(logger.registry().get(addr('1')).unwrap().value_sets, 0);

    deliver(&mut logger, "3+NOVEL+2");
    run_until(&mut logger, &clock, |l| l.stats().discovery_passes == 2);

    assert_eq!(logger.registry().get(addr('1')).unwrap().value_sets, 2);
    assert_eq!(logger.settings().store().value("NOVEL"), Some(StoredValue::U32(2)));
}

#[test]
fn test_unreachable_broker_drops_batch_but_logs() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::new().failing_connects(100));

    logger.trigger_cycle();
    run_until(&mut logger, &clock, |l| l.stats().cycles_completed == 1);

    assert_eq!(logger.stats().batches_published, 0);
    assert_eq!(logger.stats().publish_failures, 1);
    assert!(logger.link().transport().published().is_empty());
    assert_eq!(logger.sink().lines().len(), 1);
}

#[test]
fn test_rebuild_keeps_persisted_settings() {
    let (mut logger, clock) = logger_with(vec![field_sensor()], ScriptedBroker::online());

    deliver(&mut logger, "1+30");
    deliver(&mut logger, "5+0+0");
    logger.tick().unwrap();
    assert!(logger.restart_requested());

    let parts = logger.into_parts();
    let mut rebuilt = DataLogger::new(config(), parts.bus_transport, parts.broker_transport, parts.store, parts.sink, parts.clock).unwrap();
    rebuilt.start().unwrap();

    assert!(!rebuilt.restart_requested());
    assert_eq!(rebuilt.settings().live().period_us, 30_000_000);
    assert_eq!(rebuilt.settings().live().utc_offset_s(), 0);
    assert_eq!(rebuilt.registry().len(), 1);

    rebuilt.trigger_cycle();
    run_until(&mut rebuilt, &clock, |l| l.stats().cycles_completed == 1);
    assert_eq!(rebuilt.stats().batches_published, 1);
}

#[test]
fn test_tick_before_start_is_noop() {
    let clock = ManualClock::new();
    let bus = SimulatedBus::new(clock.clone()).with_sensor(field_sensor());
    let mut logger = DataLogger::new(config(), bus, ScriptedBroker::online(), MemoryStore::new(), MemorySink::new(), clock).unwrap();

    assert_eq!(logger.tick().unwrap(), None);
    assert_eq!(logger.stats().ticks, 0);
    assert!(logger.bus().transport().transcript().is_empty());
}

#[test]
fn test_invalid_config_rejected() {
    let clock = ManualClock::new();
    let config = LoggerConfig {
        tenant: String::new(),
        ..LoggerConfig::default()
    };
    let result = DataLogger::new(config, SimulatedBus::new(clock.clone()), ScriptedBroker::online(), MemoryStore::new(), MemorySink::new(), clock);
    assert!(result.is_err());
}
