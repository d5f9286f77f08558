//! Coordination plane of the compute relay: ledger, worker registry, dispatch,
//! job lifecycle and settlement consensus over a transactional [`relay_store::Store`].

pub mod chain;
pub mod consensus;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod event_log;
pub mod ledger;
pub mod qos;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod selector;
pub mod shutdown;
pub mod stats;
pub mod tasks;

pub use chain::{ChainClient, ChainError, ChainSync, SettlementAnchor};
pub use consensus::{GroupOutcome, ValidationRequest};
pub use dispatch::{DispatchOutcome, DispatchQueue, Dispatcher, QueuedJob};
pub use error::{ErrorKind, RelayError};
pub use event_log::{DomainEvent, EventLog};
pub use ledger::Ledger;
pub use registry::JoinRequest;
pub use relay::Relay;
pub use selector::{Sampler, StakeNormalizer};
pub use shutdown::Shutdown;
pub use stats::{NetworkStats, StatsRollup};
pub use tasks::{CreatedJob, NewJob};
