pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod worker;

pub use config::RelayConfig;
pub use error::*;
pub use event::*;
pub use ids::*;
pub use job::*;
pub use worker::*;
