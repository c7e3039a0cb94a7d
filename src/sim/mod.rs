//! In-memory collaborators for tests and the simulator binary.

pub mod broker;
pub mod bus;
pub mod store;

pub use broker::ScriptedBroker;
pub use bus::{SimSensor, SimulatedBus, TranscriptEntry};
pub use store::{MemorySink, MemoryStore, StoredValue};
