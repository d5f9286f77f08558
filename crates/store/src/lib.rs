//! Transactional persistence for jobs, workers, model caches, balances and events.
//!
//! The engine only sees [`Store`] / [`StoreTx`]. Two backends exist:
//! [`MemoryStore`] for tests and single-process dev runs, and [`PgStore`]
//! on PostgreSQL.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::{Store, StoreTx};
