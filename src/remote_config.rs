//! Remote configuration channel.
//!
//! Payloads are `+`-delimited with an integer command code in field 0, e.g.
//! `1+60` sets a one-minute interval and `2+3+b` moves sensor `3` to `b`.
//! A payload is fully parsed and validated before anything is mutated.

use crate::address::{AddressError, SensorAddress};
use crate::codec::{ModelId, MAX_MODEL_ID_LEN};
use crate::ports::{InboundMessage, KeyValueStore};
use crate::settings::{self, SettingChange, SettingsStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const FIELD_DELIMITER: char = '+';
/// Data pages are addressed `D0..D9`.
pub const MAX_VALUE_SETS: u8 = 10;

/// One entry of the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub code: u16,
    pub name: &'static str,
    pub arity: usize,
}

pub const CMD_CSV: u16 = 0;
pub const CMD_INTERVAL: u16 = 1;
pub const CMD_CHANGE_ADDRESS: u16 = 2;
pub const CMD_VALUE_SETS: u16 = 3;
pub const CMD_SD_LOGGING: u16 = 4;
pub const CMD_TIME_ZONE: u16 = 5;

pub const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec { code: CMD_CSV, name: "csv", arity: 1 },
    CommandSpec { code: CMD_INTERVAL, name: "interval", arity: 1 },
    CommandSpec { code: CMD_CHANGE_ADDRESS, name: "change-address", arity: 2 },
    CommandSpec { code: CMD_VALUE_SETS, name: "value-sets", arity: 2 },
    CommandSpec { code: CMD_SD_LOGGING, name: "sd-logging", arity: 1 },
    CommandSpec { code: CMD_TIME_ZONE, name: "time-zone", arity: 2 },
];

pub fn lookup(code: u16) -> Option<&'static CommandSpec> {
    COMMAND_TABLE.iter().find(|spec| spec.code == code)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("empty configuration payload")]
    Empty,
    #[error("command code '{0}' is not an integer")]
    InvalidCode(alloc::string::String),
    #[error("{command} takes {expected} arguments, got {actual}")]
    MissingArgument { command: &'static str, expected: usize, actual: usize },
    #[error("'{0}' is not a boolean")]
    InvalidBool(alloc::string::String),
    #[error("'{0}' is not a valid integer")]
    InvalidInteger(alloc::string::String),
    #[error("polling interval must be at least one second")]
    ZeroInterval,
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("address change from '{0}' to itself")]
    SameAddress(SensorAddress),
    #[error("'{0}' is not a valid model id")]
    InvalidModel(alloc::string::String),
    #[error("model id '{0}' collides with a settings key")]
    ReservedModel(alloc::string::String),
    #[error("value-set count {0} is out of range")]
    ValueSetsOutOfRange(u32),
}

/// A decoded, validated configuration command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigCommand {
    SetCsv(bool),
    SetInterval { seconds: u32 },
    ChangeAddress { from: SensorAddress, to: SensorAddress },
    SetValueSets { model: ModelId, value_sets: u8 },
    SetSdLogging(bool),
    SetTimeZone { gmt_offset_s: i32, dst_offset_s: u32 },
}

/// Decode a payload. `Ok(None)` is a well-formed code the table doesn't know.
pub fn parse(payload: &str) -> Result<Option<ConfigCommand>, ConfigError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(ConfigError::Empty);
    }

    let mut fields = payload.split(FIELD_DELIMITER).map(str::trim);
    let code_field = fields.next().unwrap_or_default();
    let code = code_field
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidCode(code_field.into()))?;
    let Some(spec) = lookup(code) else {
        return Ok(None);
    };

    let args: alloc::vec::Vec<&str> = fields.collect();
    if args.len() < spec.arity {
        return Err(ConfigError::MissingArgument {
            command: spec.name,
            expected: spec.arity,
            actual: args.len(),
        });
    }
    if args.len() > spec.arity {
        debug!(command = spec.name, extra = args.len() - spec.arity, "ignoring extra arguments");
    }

    let command = match code {
        CMD_CSV => ConfigCommand::SetCsv(parse_bool(args[0])?),
        CMD_INTERVAL => {
            let seconds = parse_int::<u32>(args[0])?;
            if seconds == 0 {
                return Err(ConfigError::ZeroInterval);
            }
            ConfigCommand::SetInterval { seconds }
        }
        CMD_CHANGE_ADDRESS => {
            let from = SensorAddress::parse(args[0])?;
            let to = SensorAddress::parse(args[1])?;
            if from == to {
                return Err(ConfigError::SameAddress(from));
            }
            ConfigCommand::ChangeAddress { from, to }
        }
        CMD_VALUE_SETS => {
            let model = parse_model(args[0])?;
            let count = parse_int::<u32>(args[1])?;
            let value_sets = u8::try_from(count)
                .ok()
                .filter(|&n| n <= MAX_VALUE_SETS)
                .ok_or(ConfigError::ValueSetsOutOfRange(count))?;
            ConfigCommand::SetValueSets { model, value_sets }
        }
        CMD_SD_LOGGING => ConfigCommand::SetSdLogging(parse_bool(args[0])?),
        CMD_TIME_ZONE => ConfigCommand::SetTimeZone {
            gmt_offset_s: parse_int::<i32>(args[0])?,
            dst_offset_s: parse_int::<u32>(args[1])?,
        },
        _ => return Ok(None),
    };
    Ok(Some(command))
}

/// `true`/`false` in any case, or `1`/`0`.
pub fn parse_bool(field: &str) -> Result<bool, ConfigError> {
    if field.eq_ignore_ascii_case("true") || field == "1" {
        Ok(true)
    } else if field.eq_ignore_ascii_case("false") || field == "0" {
        Ok(false)
    } else {
        Err(ConfigError::InvalidBool(field.into()))
    }
}

fn parse_int<T: core::str::FromStr>(field: &str) -> Result<T, ConfigError> {
    field.parse().map_err(|_| ConfigError::InvalidInteger(field.into()))
}

fn parse_model(field: &str) -> Result<ModelId, ConfigError> {
    let valid = !field.is_empty() && field.len() <= MAX_MODEL_ID_LEN && field.bytes().all(|b| b.is_ascii_alphanumeric());
    let mut model = ModelId::new();
    if !valid || model.push_str(field).is_err() {
        return Err(ConfigError::InvalidModel(field.into()));
    }
    if settings::is_reserved_key(field) {
        return Err(ConfigError::ReservedModel(field.into()));
    }
    Ok(model)
}

/// What the logger must do after a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOutcome {
    Applied { persisted: bool },
    Rediscover { persisted: bool },
    ChangeAddress { from: SensorAddress, to: SensorAddress },
    Restart { persisted: bool },
    Ignored,
    Rejected(ConfigError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStats {
    pub applied: u32,
    pub rejected: u32,
    pub ignored: u32,
    pub foreign_topic: u32,
}

#[derive(Debug)]
pub struct RemoteConfigChannel {
    topic: alloc::string::String,
    stats: ConfigStats,
}

impl RemoteConfigChannel {
    pub fn new(topic: &str) -> Self {
        Self { topic: topic.into(), stats: ConfigStats::default() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> &ConfigStats {
        &self.stats
    }

    pub fn handle<S: KeyValueStore>(&mut self, message: &InboundMessage, settings: &mut SettingsStore<S>) -> ConfigOutcome {
        if message.topic != self.topic {
            self.stats.foreign_topic = self.stats.foreign_topic.saturating_add(1);
            info!(topic = %message.topic, "downlink on unhandled channel discarded");
            return ConfigOutcome::Ignored;
        }

        let command = match parse(&message.payload) {
            Ok(Some(command)) => command,
            Ok(None) => {
                self.stats.ignored = self.stats.ignored.saturating_add(1);
                debug!(payload = %message.payload, "unknown config command ignored");
                return ConfigOutcome::Ignored;
            }
            Err(e) => {
                self.stats.rejected = self.stats.rejected.saturating_add(1);
                error!(payload = %message.payload, error = %e, "config command rejected");
                return ConfigOutcome::Rejected(e);
            }
        };

        self.stats.applied = self.stats.applied.saturating_add(1);
        info!(?command, "config command accepted");
        match command {
            ConfigCommand::SetCsv(csv) => ConfigOutcome::Applied { persisted: settings.apply(SettingChange::Csv(csv)).persisted },
            ConfigCommand::SetInterval { seconds } => ConfigOutcome::Applied {
                persisted: settings.apply(SettingChange::PollingInterval { seconds }).persisted,
            },
            ConfigCommand::ChangeAddress { from, to } => ConfigOutcome::ChangeAddress { from, to },
            ConfigCommand::SetValueSets { model, value_sets } => ConfigOutcome::Rediscover {
                persisted: settings.apply(SettingChange::ValueSetOverride { model, value_sets }).persisted,
            },
            ConfigCommand::SetSdLogging(enabled) => {
                let report = settings.apply(SettingChange::SdLogging(enabled));
                warn!("restart requested by config command");
                ConfigOutcome::Restart { persisted: report.persisted }
            }
            ConfigCommand::SetTimeZone { gmt_offset_s, dst_offset_s } => {
                let report = settings.apply(SettingChange::TimeZone { gmt_offset_s, dst_offset_s });
                warn!("restart requested by config command");
                ConfigOutcome::Restart { persisted: report.persisted }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_codes_unique() {
        for (i, spec) in COMMAND_TABLE.iter().enumerate() {
            assert!(COMMAND_TABLE[i + 1..].iter().all(|other| other.code != spec.code), "duplicate code {}", spec.code);
        }
    }

    #[test]
    fn test_parse_each_command() {
        assert_eq!(parse("0+TRUE").unwrap(), Some(ConfigCommand::SetCsv(true)));
        assert_eq!(parse("1+60").unwrap(), Some(ConfigCommand::SetInterval { seconds: 60 }));
        assert_eq!(
            parse("2+3+b").unwrap(),
            Some(ConfigCommand::ChangeAddress {
                from: SensorAddress::new('3').unwrap(),
                to: SensorAddress::new('b').unwrap()
            })
        );
        assert!(matches!(parse("3+TER12+2").unwrap(), Some(ConfigCommand::SetValueSets { value_sets: 2, .. })));
        assert_eq!(parse("4+0").unwrap(), Some(ConfigCommand::SetSdLogging(false)));
        assert_eq!(
            parse("5+-12600+3600").unwrap(),
            Some(ConfigCommand::SetTimeZone { gmt_offset_s: -12_600, dst_offset_s: 3_600 })
        );
    }

    #[test]
    fn test_unknown_code_is_not_an_error() {
        assert_eq!(parse("42+whatever").unwrap(), None);
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(parse(""), Err(ConfigError::Empty));
        assert!(matches!(parse("x+1"), Err(ConfigError::InvalidCode(_))));
        assert!(matches!(parse("1"), Err(ConfigError::MissingArgument { expected: 1, actual: 0, .. })));
        assert_eq!(parse("1+0"), Err(ConfigError::ZeroInterval));
        assert!(matches!(parse("0+yes"), Err(ConfigError::InvalidBool(_))));
        assert!(matches!(parse("2+3+#"), Err(ConfigError::InvalidAddress(_))));
        assert!(matches!(parse("2+3+3"), Err(ConfigError::SameAddress(_))));
        assert_eq!(parse("3+TER12+11"), Err(ConfigError::ValueSetsOutOfRange(11)));
        assert_eq!(parse("3+period+2"), Err(ConfigError::ReservedModel("period".into())));
    }
}
