use sdilog::address::SensorAddress;
use sdilog::bus::{BusOwner, SensorBus};
use sdilog::clock::ManualClock;
use sdilog::config::BusTiming;
use sdilog::discovery::{DiscoveryScan, ScanProgress};
use sdilog::ports::KeyValueStore;
use sdilog::settings::SettingsStore;
use sdilog::sim::{MemoryStore, SimSensor, SimulatedBus};

fn addr(c: char) -> SensorAddress {
    SensorAddress::new(c).unwrap()
}

fn bus_with(sensors: Vec<SimSensor>) -> SensorBus<SimulatedBus<ManualClock>, ManualClock> {
    let clock = ManualClock::new();
    let mut sim = SimulatedBus::new(clock.clone());
    for sensor in sensors {
        sim.add_sensor(sensor);
    }
    SensorBus::new(sim, clock, BusTiming::default())
}

fn settings() -> SettingsStore<MemoryStore> {
    SettingsStore::load(MemoryStore::new())
}

#[test]
fn test_registry_follows_scan_order() {
    let mut bus = bus_with(vec![
        SimSensor::new(addr('B'), "X"),
        SimSensor::new(addr('b'), "X"),
        SimSensor::new(addr('3'), "X"),
        SimSensor::new(addr('Z'), "X"),
    ]);
    let report = DiscoveryScan::run_to_completion(&mut bus, &settings()).unwrap();

    let order: String = report.registry.addresses().map(SensorAddress::as_char).collect();
    assert_eq!(order, "3bBZ");
    assert_eq!(report.probed, 62);
    assert!(!bus.is_busy());
}

#[test]
fn test_sensor_answering_on_third_attempt_is_found() {
    let mut bus = bus_with(vec![
        SimSensor::new(addr('4'), "X").with_silent_probes(2),
        SimSensor::new(addr('5'), "X").with_silent_probes(3),
    ]);
    let report = DiscoveryScan::run_to_completion(&mut bus, &settings()).unwrap();

    assert!(report.registry.contains(addr('4')));
    assert!(!report.registry.contains(addr('5')));
    // Three acknowledges each, no more
    assert_eq!(bus.transport().count("4!"), 3);
    assert_eq!(bus.transport().count("5!"), 3);
}

#[test]
fn test_value_set_resolution_order() {
    let mut store = MemoryStore::new();
    store.put_u32("TER12", 4).unwrap();
    let settings = SettingsStore::load(store);

    let mut bus = bus_with(vec![
        SimSensor::new(addr('0'), "TER12"),
        SimSensor::new(addr('1'), "ATM41"),
        SimSensor::new(addr('2'), "NOVEL"),
    ]);
    let registry = DiscoveryScan::run_to_completion(&mut bus, &settings).unwrap().registry;

    // Persisted override beats the model table
    assert_eq!(registry.get(addr('0')).unwrap().value_sets, 4);
    assert_eq!(registry.get(addr('1')).unwrap().value_sets, 3);
    assert_eq!(registry.get(addr('2')).unwrap().value_sets, 0);
    assert_eq!(registry.get(addr('1')).unwrap().model.as_deref(), Some("ATM41"));
}

#[test]
fn test_stored_zero_override_beats_model_table() {
    let mut store = MemoryStore::new();
    store.put_u32("ATM41", 0).unwrap();
    let settings = SettingsStore::load(store);

    let mut bus = bus_with(vec![SimSensor::new(addr('1'), "ATM41")]);
    let registry = DiscoveryScan::run_to_completion(&mut bus, &settings).unwrap().registry;
    assert_eq!(registry.get(addr('1')).unwrap().value_sets, 0);
}

#[test]
fn test_failed_identify_keeps_sensor() {
    let mut bus = bus_with(vec![SimSensor::new(addr('7'), "ATM41").without_info()]);
    let report = DiscoveryScan::run_to_completion(&mut bus, &settings()).unwrap();

    let record = report.registry.get(addr('7')).unwrap();
    assert_eq!(record.value_sets, 0);
    assert!(record.model.is_none());
    assert_eq!(report.identify_failures, 1);
}

#[test]
fn test_incremental_scan_holds_bus_until_finished() {
    let settings = settings();
    let mut bus = bus_with(vec![SimSensor::new(addr('a'), "X")]);
    let mut scan = DiscoveryScan::begin(&mut bus).unwrap();
    assert_eq!(bus.holder(), Some(BusOwner::Discovery));

    let mut steps = 0;
    let report = loop {
        match scan.step(&mut bus, &settings) {
            ScanProgress::Probed { address, present } => {
                steps += 1;
                assert_eq!(present, address == addr('a'));
                assert!(bus.is_busy());
            }
            ScanProgress::Finished(report) => break report,
        }
    };

    assert_eq!(steps, 62);
    assert_eq!(report.registry.len(), 1);
    assert!(!bus.is_busy());
}

#[test]
fn test_scan_refused_while_bus_held() {
    let mut bus = bus_with(Vec::new());
    bus.acquire(BusOwner::Measurement).unwrap();
    assert!(DiscoveryScan::begin(&mut bus).is_err());
}

#[test]
fn test_address_change_then_rediscovery() {
    let mut bus = bus_with(vec![SimSensor::new(addr('1'), "X")]);
    let echoed = bus.change_address(addr('1'), addr('7')).unwrap();
    assert_eq!(echoed, addr('7'));

    let registry = DiscoveryScan::run_to_completion(&mut bus, &settings()).unwrap().registry;
    assert!(!registry.contains(addr('1')));
    assert!(registry.contains(addr('7')));
}
