use clap::{App, Arg};
use colored::*;
use sdilog::address::SensorAddress;
use sdilog::clock::SystemClock;
use sdilog::config::{LoggerConfig, MeasureMode};
use sdilog::cycle::CycleEvent;
use sdilog::ports::KeyValueStore;
use sdilog::settings::{KEY_CSV, KEY_PERIOD, US_PER_SECOND};
use sdilog::sim::{MemorySink, MemoryStore, ScriptedBroker, SimSensor, SimulatedBus};
use sdilog::DataLogger;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_TICK_MS: &str = "50";
const STDIN_BUFFER: usize = 16;

type SimLogger = DataLogger<SimulatedBus<SystemClock>, ScriptedBroker, MemoryStore, MemorySink, SystemClock>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("sdilog-simulator")
        .version("0.1.0")
        .author("Field Systems Engineering Team")
        .about("Runs the data logger core against simulated sensors and broker")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Logger configuration (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tick")
                .short("t")
                .long("tick-ms")
                .value_name("MS")
                .help("Loop period")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("SECONDS")
                .help("Polling interval stored before boot")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("segmented")
                .long("segmented")
                .help("Publish one channel per value"),
        )
        .arg(
            Arg::with_name("sequential")
                .long("sequential")
                .help("Measure sensors one at a time with aM!"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => LoggerConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => LoggerConfig::default(),
    };
    if matches.is_present("sequential") {
        config.measure_mode = MeasureMode::Sequential;
    }
    let tick_ms: u64 = matches.value_of("tick").unwrap_or(DEFAULT_TICK_MS).parse()?;

    let mut store = MemoryStore::new();
    if let Some(seconds) = matches.value_of("interval") {
        let seconds: u64 = seconds.parse()?;
        store.put_u64(KEY_PERIOD, seconds * US_PER_SECOND)?;
    }
    if matches.is_present("segmented") {
        store.put_bool(KEY_CSV, false)?;
    }

    println!("{}", "sdilog simulator".bright_blue().bold());
    println!("  tenant {}  zone {}  device {}", config.tenant, config.zone, config.device_id);
    println!("  config channel {}", config.config_topic().cyan());
    println!("{}", "Type a config payload (e.g. 1+30), 'measure', or 'status'.".yellow());

    let clock = SystemClock::new();
    let mut logger = build(config.clone(), demo_bus(clock), ScriptedBroker::online(), store, MemorySink::new(), clock)?;
    boot(&mut logger)?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(STDIN_BUFFER);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut interval = time::interval(Duration::from_millis(tick_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }

        while let Ok(line) = line_rx.try_recv() {
            handle_line(&mut logger, line.trim());
        }

        match logger.tick() {
            Ok(Some(event)) => print_event(&event),
            Ok(None) => {}
            Err(e) => error!("logger error: {}", e),
        }
        for (topic, payload) in logger.link_mut().transport_mut().take_published() {
            println!("{} {} {}", "->".green(), topic.bright_white(), payload.bright_green());
        }

        if logger.restart_requested() {
            warn!("restart requested; rebuilding logger from persisted settings");
            let parts = logger.into_parts();
            logger = build(config.clone(), parts.bus_transport, parts.broker_transport, parts.store, parts.sink, parts.clock)?;
            boot(&mut logger)?;
        }
    }

    logger.stop();
    println!("{}", serde_json::to_string_pretty(&logger.status())?);
    Ok(())
}

fn build(
    config: LoggerConfig,
    bus: SimulatedBus<SystemClock>,
    broker: ScriptedBroker,
    store: MemoryStore,
    sink: MemorySink,
    clock: SystemClock,
) -> Result<SimLogger, sdilog::LoggerError> {
    DataLogger::new(config, bus, broker, store, sink, clock)
}

fn boot(logger: &mut SimLogger) -> Result<(), sdilog::LoggerError> {
    println!("{}", "Scanning sensor bus...".yellow());
    let registry = logger.start()?;
    for record in registry.records() {
        let model = record.model.as_ref().map_or("?", |model| model.as_str());
        println!("  {} sensor {} model {} value sets {}", "+".green(), record.address, model, record.value_sets);
    }
    Ok(())
}

fn demo_bus(clock: SystemClock) -> SimulatedBus<SystemClock> {
    let sensor = |c: char, model: &str| SensorAddress::new(c).map(|address| SimSensor::new(address, model));
    let mut bus = SimulatedBus::new(clock);
    if let Ok(soil) = sensor('0', "TER12") {
        bus.add_sensor(soil.with_values(&[(0.231, 3), (21.4, 1), (1.05, 2)]).with_delay(1).with_drift(0.05));
    }
    if let Ok(weather) = sensor('3', "ATM41") {
        bus.add_sensor(
            weather
                .with_values(&[(98.2, 1), (12.5, 1), (-3.1, 1), (61.0, 1), (4.2, 1), (270.0, 1)])
                .with_pages(3)
                .with_delay(2)
                .with_drift(0.2),
        );
    }
    if let Ok(flaky) = sensor('b', "GS3") {
        bus.add_sensor(flaky.with_values(&[(1.7, 2), (18.9, 1)]).with_short_reads(2).with_silent_probes(1));
    }
    bus
}

fn handle_line(logger: &mut SimLogger, line: &str) {
    match line {
        "" => {}
        "status" => match serde_json::to_string_pretty(&logger.status()) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("status encoding failed: {}", e),
        },
        "measure" => logger.trigger_cycle(),
        payload => {
            let topic = logger.config().config_topic();
            logger.link_mut().transport_mut().deliver(&topic, payload);
            println!("{} {}", "<-".blue(), payload);
        }
    }
}

fn print_event(event: &CycleEvent) {
    match event {
        CycleEvent::Started { sensors } => println!("{} cycle started ({} sensors)", "*".cyan(), sensors),
        CycleEvent::Batch(batch) => {
            let values = sdilog::telemetry::joined_payload(&batch.readings);
            println!("  {} {} [{}] retries {}", "ok".green(), batch.address, values, batch.retries);
        }
        CycleEvent::Dropped { address, reason, attempts } => {
            println!("  {} {} {:?} after {} attempts", "drop".red(), address, reason, attempts);
        }
        CycleEvent::Completed(summary) => println!(
            "{} cycle done: {} batches, {} drops, {} ms",
            "*".cyan(),
            summary.batches,
            summary.drops,
            summary.finished_at_ms.saturating_sub(summary.started_at_ms)
        ),
    }
}
