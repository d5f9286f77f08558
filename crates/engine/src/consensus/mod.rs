//! Settlement consensus: commitment reveal, VRF sampling, result agreement and payout.

pub mod commitment;
pub mod compare;
pub mod payout;
pub mod validation;
pub mod vrf;

pub use payout::split_payment;
pub use validation::{GroupOutcome, ValidationRequest};
