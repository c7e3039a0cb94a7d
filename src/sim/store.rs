use crate::ports::{KeyValueStore, LogSink, StoreError};
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    Bool(bool),
    I32(i32),
    U32(u32),
    U64(u64),
}

/// Typed key-value store held in memory. Serializable so the simulator can
/// carry it across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    values: HashMap<String, StoredValue>,
    #[serde(skip)]
    pub fail_writes: bool,
    #[serde(skip)]
    pub writes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &str) -> Option<StoredValue> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn put(&mut self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.into()));
        }
        if self.fail_writes {
            return Err(StoreError::WriteFailed(key.into()));
        }
        self.values.insert(key.into(), value);
        self.writes += 1;
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.value(key) {
            Some(StoredValue::Bool(value)) => value,
            _ => default,
        }
    }

    fn get_i32(&self, key: &str, default: i32) -> i32 {
        match self.value(key) {
            Some(StoredValue::I32(value)) => value,
            _ => default,
        }
    }

    fn get_u32(&self, key: &str, default: u32) -> u32 {
        match self.value(key) {
            Some(StoredValue::U32(value)) => value,
            _ => default,
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.value(key) {
            Some(StoredValue::U64(value)) => value,
            _ => default,
        }
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put(key, StoredValue::Bool(value))
    }

    fn put_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.put(key, StoredValue::I32(value))
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.put(key, StoredValue::U32(value))
    }

    fn put_u64(&mut self, key: &str, value: u64) -> Result<(), StoreError> {
        self.put(key, StoredValue::U64(value))
    }
}

/// Log sink that keeps every line.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl LogSink for MemorySink {
    fn append(&mut self, line: &str) {
        self.lines.push(line.into());
    }
}
