use sdilog::address::SensorAddress;
use sdilog::ports::InboundMessage;
use sdilog::remote_config::{ConfigError, ConfigOutcome, RemoteConfigChannel};
use sdilog::settings::{LiveSettings, SettingsStore, KEY_CSV, KEY_DST, KEY_GMT, KEY_PERIOD, KEY_SD};
use sdilog::sim::{MemoryStore, StoredValue};

const TOPIC: &str = "tenant/logger/config";

fn channel() -> RemoteConfigChannel {
    RemoteConfigChannel::new(TOPIC)
}

fn message(payload: &str) -> InboundMessage {
    InboundMessage::new(TOPIC, payload)
}

fn settings() -> SettingsStore<MemoryStore> {
    SettingsStore::load(MemoryStore::new())
}

#[test]
fn test_csv_flag_persisted_alone() {
    let mut settings = settings();
    let outcome = channel().handle(&message("0+false"), &mut settings);

    assert_eq!(outcome, ConfigOutcome::Applied { persisted: true });
    assert!(!settings.live().csv);
    assert_eq!(settings.store().value(KEY_CSV), Some(StoredValue::Bool(false)));
    assert_eq!(settings.store().writes, 1);

    let defaults = LiveSettings::default();
    assert_eq!(settings.live().period_us, defaults.period_us);
    assert_eq!(settings.live().sd_logging, defaults.sd_logging);
}

#[test]
fn test_csv_flag_set_back_to_true() {
    let mut settings = settings();
    let mut channel = channel();
    channel.handle(&message("0+false"), &mut settings);
    assert_eq!(channel.handle(&message("0+TRUE"), &mut settings), ConfigOutcome::Applied { persisted: true });

    assert!(settings.live().csv);
    assert_eq!(settings.store().value(KEY_CSV), Some(StoredValue::Bool(true)));
    assert_eq!(settings.store().writes, 2);
    assert!(SettingsStore::load(settings.into_store()).live().csv);
}

#[test]
fn test_interval_stored_in_microseconds() {
    let mut settings = settings();
    channel().handle(&message("1+60"), &mut settings);

    assert_eq!(settings.live().period_us, 60_000_000);
    assert_eq!(settings.live().period_ms(), 60_000);
    assert_eq!(settings.store().value(KEY_PERIOD), Some(StoredValue::U64(60_000_000)));
}

#[test]
fn test_settings_survive_reload() {
    let mut settings = settings();
    let mut channel = channel();
    channel.handle(&message("1+30"), &mut settings);
    channel.handle(&message("4+false"), &mut settings);
    channel.handle(&message("5+3600+0"), &mut settings);

    let reloaded = SettingsStore::load(settings.into_store());
    assert_eq!(reloaded.live().period_us, 30_000_000);
    assert!(!reloaded.live().sd_logging);
    assert_eq!(reloaded.live().gmt_offset_s, 3_600);
    assert_eq!(reloaded.live().dst_offset_s, 0);
}

#[test]
fn test_malformed_payloads_change_nothing() {
    let mut settings = settings();
    let mut channel = channel();
    for payload in ["", "+", "abc", "1", "1+zero", "1+0", "0+maybe", "2+1", "2+1+1", "2+1+?", "3+TER12", "3+TER12+11", "5+1"] {
        let outcome = channel.handle(&message(payload), &mut settings);
        assert!(matches!(outcome, ConfigOutcome::Rejected(_)), "{:?} -> {:?}", payload, outcome);
    }

    assert_eq!(settings.live(), &LiveSettings::default());
    assert_eq!(settings.store().writes, 0);
    assert!(settings.store().is_empty());
    assert_eq!(channel.stats().rejected, 13);
    assert_eq!(channel.stats().applied, 0);
}

#[test]
fn test_specific_rejections() {
    let mut settings = settings();
    let mut channel = channel();
    assert_eq!(channel.handle(&message("1+0"), &mut settings), ConfigOutcome::Rejected(ConfigError::ZeroInterval));
    assert_eq!(
        channel.handle(&message("3+ATM41+12"), &mut settings),
        ConfigOutcome::Rejected(ConfigError::ValueSetsOutOfRange(12))
    );
}

#[test]
fn test_persistence_failure_still_applies() {
    let mut store = MemoryStore::new();
    store.fail_writes = true;
    let mut settings = SettingsStore::load(store);

    let outcome = channel().handle(&message("1+120"), &mut settings);

    assert_eq!(outcome, ConfigOutcome::Applied { persisted: false });
    assert_eq!(settings.live().period_us, 120_000_000);
    assert_eq!(settings.write_failures(), 1);
    assert!(settings.store().value(KEY_PERIOD).is_none());
}

#[test]
fn test_address_change_outcome() {
    let mut settings = settings();
    let outcome = channel().handle(&message("2+1+7"), &mut settings);
    assert_eq!(
        outcome,
        ConfigOutcome::ChangeAddress {
            from: SensorAddress::new('1').unwrap(),
            to: SensorAddress::new('7').unwrap(),
        }
    );
    assert_eq!(settings.store().writes, 0);
}

#[test]
fn test_value_sets_trigger_rediscovery() {
    let mut settings = settings();
    let outcome = channel().handle(&message("3+GS3+2"), &mut settings);

    assert_eq!(outcome, ConfigOutcome::Rediscover { persisted: true });
    assert_eq!(settings.value_set_override("GS3"), Some(2));
    assert_eq!(settings.store().value("GS3"), Some(StoredValue::U32(2)));
}

#[test]
fn test_value_sets_cannot_overwrite_settings_keys() {
    let mut settings = settings();
    let mut channel = channel();
    channel.handle(&message("0+false"), &mut settings);

    for key in ["csv", "period", "sd", "gmt", "dst"] {
        let outcome = channel.handle(&message(&format!("3+{}+2", key)), &mut settings);
        assert_eq!(outcome, ConfigOutcome::Rejected(ConfigError::ReservedModel(key.into())));
    }

    assert_eq!(settings.store().value(KEY_CSV), Some(StoredValue::Bool(false)));
    let reloaded = SettingsStore::load(settings.into_store());
    assert!(!reloaded.live().csv);
    assert_eq!(reloaded.live().period_us, LiveSettings::default().period_us);
}

#[test]
fn test_zero_value_sets_override_persists() {
    let mut settings = settings();
    assert_eq!(channel().handle(&message("3+ATM41+0"), &mut settings), ConfigOutcome::Rediscover { persisted: true });
    assert_eq!(settings.value_set_override("ATM41"), Some(0));

    let reloaded = SettingsStore::load(settings.into_store());
    assert_eq!(reloaded.value_set_override("ATM41"), Some(0));
}

#[test]
fn test_logging_and_time_zone_request_restart() {
    let mut settings = settings();
    let mut channel = channel();

    assert_eq!(channel.handle(&message("4+TRUE"), &mut settings), ConfigOutcome::Restart { persisted: true });
    assert_eq!(settings.store().value(KEY_SD), Some(StoredValue::Bool(true)));

    assert_eq!(channel.handle(&message("5+-10800+0"), &mut settings), ConfigOutcome::Restart { persisted: true });
    assert_eq!(settings.store().value(KEY_GMT), Some(StoredValue::I32(-10_800)));
    assert_eq!(settings.store().value(KEY_DST), Some(StoredValue::U32(0)));
    assert_eq!(settings.live().utc_offset_s(), -10_800);
}

#[test]
fn test_unknown_code_and_foreign_topic_ignored() {
    let mut settings = settings();
    let mut channel = channel();

    assert_eq!(channel.handle(&message("9+1"), &mut settings), ConfigOutcome::Ignored);
    assert_eq!(
        channel.handle(&InboundMessage::new("tenant/other/config", "0+false"), &mut settings),
        ConfigOutcome::Ignored
    );
    assert!(settings.live().csv);
    assert_eq!(channel.stats().ignored, 1);
    assert_eq!(channel.stats().foreign_topic, 1);
}

#[test]
fn test_extra_arguments_ignored() {
    let mut settings = settings();
    let outcome = channel().handle(&message("1+45+junk"), &mut settings);
    assert_eq!(outcome, ConfigOutcome::Applied { persisted: true });
    assert_eq!(settings.live().period_us, 45_000_000);
}
