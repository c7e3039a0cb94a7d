use crate::address::{SensorAddress, ADDRESS_SPACE};
use crate::codec::ModelId;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("sensor '{0}' is already registered")]
    DuplicateAddress(SensorAddress),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub address: SensorAddress,
    /// Data-retrieve pages to read per measurement; 0 means a single `D0`.
    pub value_sets: u8,
    pub model: Option<ModelId>,
}

impl SensorRecord {
    pub fn new(address: SensorAddress, value_sets: u8) -> Self {
        Self { address, value_sets, model: None }
    }

    pub fn with_model(mut self, model: ModelId) -> Self {
        self.model = Some(model);
        self
    }

    /// Number of `aD<n>!` exchanges a retrieve step issues.
    pub fn retrieve_pages(&self) -> u8 {
        self.value_sets.max(1)
    }
}

/// Sensors found by the last discovery pass, in scan order.
///
/// Built whole and swapped in by the owner; never patched in place.
#[derive(Debug, Clone)]
pub struct SensorRegistry {
    records: Vec<SensorRecord, ADDRESS_SPACE>,
    by_rank: [Option<u8>; ADDRESS_SPACE],
}

impl SensorRegistry {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            by_rank: [None; ADDRESS_SPACE],
        }
    }

    /// Build from records in any order; the result is sorted by scan order.
    pub fn from_records<I>(records: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = SensorRecord>,
    {
        let mut slots: [Option<SensorRecord>; ADDRESS_SPACE] = core::array::from_fn(|_| None);
        for record in records {
            let slot = &mut slots[record.address.rank()];
            if slot.is_some() {
                return Err(RegistryError::DuplicateAddress(record.address));
            }
            *slot = Some(record);
        }

        let mut registry = Self::empty();
        for record in slots.into_iter().flatten() {
            let position = registry.records.len() as u8;
            registry.by_rank[record.address.rank()] = Some(position);
            // At most one record per rank, so capacity cannot be exceeded.
            let _ = registry.records.push(record);
        }
        Ok(registry)
    }

    pub fn get(&self, address: SensorAddress) -> Option<&SensorRecord> {
        self.by_rank[address.rank()].map(|position| &self.records[usize::from(position)])
    }

    pub fn contains(&self, address: SensorAddress) -> bool {
        self.by_rank[address.rank()].is_some()
    }

    pub fn records(&self) -> &[SensorRecord] {
        &self.records
    }

    pub fn addresses(&self) -> impl Iterator<Item = SensorAddress> + '_ {
        self.records.iter().map(|record| record.address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Owned copy of the records for a consumer that outlives this borrow.
    pub fn snapshot(&self) -> Vec<SensorRecord, ADDRESS_SPACE> {
        self.records.clone()
    }
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
