//! Strongly-consistent keyed record store.
//!
//! This crate is the foundation the rest of the system coordinates through:
//! a keyed mapping with atomic conditional writes (`put_if_absent`,
//! `compare_and_set`), an atomic guarded numeric `add`, per-record TTL and
//! read-your-writes reads. Components depend only on these semantics, never
//! on a concrete backend.
//!
//! Two implementations are provided: [`InMemoryRecordStore`] for tests and
//! single-process deployments, and [`PostgresRecordStore`] as the RDBMS
//! adapter.

pub mod error;
pub mod key;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use error::{Result, StoreError};
pub use key::RecordKey;
pub use memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;
pub use record::{StoredRecord, Version};
pub use store::{AddGuard, Consistency, RecordStore};
