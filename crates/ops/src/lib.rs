//! Rekon Ops: request-based provisioning and convergence waits.

#![forbid(unsafe_code)]

pub mod provision;
pub mod readiness;
pub mod wait;

pub use provision::{is_provisioning_signal, submit};
pub use readiness::{condition_met, is_ready};
pub use wait::{WaitCoordinator, WaitOutcome, WaitTarget, DEFAULT_NOT_FOUND_TOLERANCE};
