//! Live settings and their persistence.
//!
//! [`SettingsStore`] is the single writer: every change is applied in memory
//! and written through to the key-value store in the same call. A failed
//! write is logged and reported but the in-memory value stays in effect for
//! the session.

use crate::codec::ModelId;
use crate::ports::{KeyValueStore, StoreError};
use alloc::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const KEY_CSV: &str = "csv";
pub const KEY_PERIOD: &str = "period";
pub const KEY_SD: &str = "sd";
pub const KEY_GMT: &str = "gmt";
pub const KEY_DST: &str = "dst";

/// Keys owned by the settings fields; value-set overrides, which are keyed by
/// model id, may not use them.
pub const RESERVED_KEYS: &[&str] = &[KEY_CSV, KEY_PERIOD, KEY_SD, KEY_GMT, KEY_DST];
/// Read default that marks a model without a persisted override.
const NO_OVERRIDE: u32 = u32::MAX;

pub const US_PER_SECOND: u64 = 1_000_000;
const US_PER_MS: u64 = 1_000;

const DEFAULT_CSV: bool = true;
const DEFAULT_PERIOD_US: u64 = 15 * US_PER_SECOND;
const DEFAULT_SD_LOGGING: bool = true;
const DEFAULT_GMT_OFFSET_S: i32 = -12_600;
const DEFAULT_DST_OFFSET_S: u32 = 3_600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSettings {
    /// Publish all values of a batch joined in one payload.
    pub csv: bool,
    pub period_us: u64,
    pub sd_logging: bool,
    pub gmt_offset_s: i32,
    pub dst_offset_s: u32,
    /// Value-set counts learned from configuration, by model id.
    pub value_set_overrides: BTreeMap<alloc::string::String, u8>,
}

impl LiveSettings {
    pub fn period_ms(&self) -> u64 {
        self.period_us / US_PER_MS
    }

    /// Total offset applied to wall-clock timestamps.
    pub fn utc_offset_s(&self) -> i64 {
        i64::from(self.gmt_offset_s) + i64::from(self.dst_offset_s)
    }
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            csv: DEFAULT_CSV,
            period_us: DEFAULT_PERIOD_US,
            sd_logging: DEFAULT_SD_LOGGING,
            gmt_offset_s: DEFAULT_GMT_OFFSET_S,
            dst_offset_s: DEFAULT_DST_OFFSET_S,
            value_set_overrides: BTreeMap::new(),
        }
    }
}

/// One mutation of the live settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingChange {
    Csv(bool),
    PollingInterval { seconds: u32 },
    SdLogging(bool),
    TimeZone { gmt_offset_s: i32, dst_offset_s: u32 },
    ValueSetOverride { model: ModelId, value_sets: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub persisted: bool,
    pub error: Option<StoreError>,
}

impl ApplyReport {
    fn from_result(result: Result<(), StoreError>) -> Self {
        match result {
            Ok(()) => Self { persisted: true, error: None },
            Err(e) => Self { persisted: false, error: Some(e) },
        }
    }
}

#[derive(Debug)]
pub struct SettingsStore<S: KeyValueStore> {
    live: LiveSettings,
    store: S,
    write_failures: u32,
}

impl<S: KeyValueStore> SettingsStore<S> {
    /// Read every persisted field, falling back to defaults.
    pub fn load(store: S) -> Self {
        let defaults = LiveSettings::default();
        let live = LiveSettings {
            csv: store.get_bool(KEY_CSV, defaults.csv),
            period_us: store.get_u64(KEY_PERIOD, defaults.period_us),
            sd_logging: store.get_bool(KEY_SD, defaults.sd_logging),
            gmt_offset_s: store.get_i32(KEY_GMT, defaults.gmt_offset_s),
            dst_offset_s: store.get_u32(KEY_DST, defaults.dst_offset_s),
            value_set_overrides: BTreeMap::new(),
        };
        info!(
            csv = live.csv,
            period_s = live.period_us / US_PER_SECOND,
            sd_logging = live.sd_logging,
            "settings loaded"
        );
        Self { live, store, write_failures: 0 }
    }

    pub fn live(&self) -> &LiveSettings {
        &self.live
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Hand back the store, e.g. to rebuild the logger after a restart.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn write_failures(&self) -> u32 {
        self.write_failures
    }

    /// Value-set count configured for `model`, from this session or persisted
    /// by an earlier one.
    pub fn value_set_override(&self, model: &str) -> Option<u8> {
        if let Some(&count) = self.live.value_set_overrides.get(model) {
            return Some(count);
        }
        match self.store.get_u32(model, NO_OVERRIDE) {
            NO_OVERRIDE => None,
            count => Some(u8::try_from(count).unwrap_or(u8::MAX)),
        }
    }

    pub fn apply(&mut self, change: SettingChange) -> ApplyReport {
        let result = match change {
            SettingChange::Csv(csv) => {
                self.live.csv = csv;
                self.store.put_bool(KEY_CSV, csv)
            }
            SettingChange::PollingInterval { seconds } => {
                self.live.period_us = u64::from(seconds) * US_PER_SECOND;
                self.store.put_u64(KEY_PERIOD, self.live.period_us)
            }
            SettingChange::SdLogging(enabled) => {
                self.live.sd_logging = enabled;
                self.store.put_bool(KEY_SD, enabled)
            }
            SettingChange::TimeZone { gmt_offset_s, dst_offset_s } => {
                self.live.gmt_offset_s = gmt_offset_s;
                self.live.dst_offset_s = dst_offset_s;
                self.store
                    .put_i32(KEY_GMT, gmt_offset_s)
                    .and(self.store.put_u32(KEY_DST, dst_offset_s))
            }
            SettingChange::ValueSetOverride { model, .. } if is_reserved_key(&model) => {
                Err(StoreError::InvalidKey(model.as_str().into()))
            }
            SettingChange::ValueSetOverride { model, value_sets } => {
                let result = self.store.put_u32(&model, u32::from(value_sets));
                self.live.value_set_overrides.insert(model.as_str().into(), value_sets);
                result
            }
        };

        if let Err(ref e) = result {
            self.write_failures = self.write_failures.saturating_add(1);
            warn!(error = %e, "settings write-through failed; change kept in memory");
        }
        ApplyReport::from_result(result)
    }
}

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryStore;

    fn model(id: &str) -> ModelId {
        let mut model = ModelId::new();
        model.push_str(id).unwrap();
        model
    }

    #[test]
    fn test_zero_override_survives_reload() {
        let mut settings = SettingsStore::load(MemoryStore::new());
        settings.apply(SettingChange::ValueSetOverride { model: model("ATM41"), value_sets: 0 });
        assert_eq!(settings.value_set_override("ATM41"), Some(0));

        let reloaded = SettingsStore::load(settings.into_store());
        assert_eq!(reloaded.value_set_override("ATM41"), Some(0));
        assert_eq!(reloaded.value_set_override("TER12"), None);
    }

    #[test]
    fn test_override_cannot_claim_settings_key() {
        let mut settings = SettingsStore::load(MemoryStore::new());
        settings.apply(SettingChange::Csv(false));
        let report = settings.apply(SettingChange::ValueSetOverride { model: model("csv"), value_sets: 2 });

        assert!(!report.persisted);
        assert!(settings.live().value_set_overrides.is_empty());
        assert!(!SettingsStore::load(settings.into_store()).live().csv);
    }
}
