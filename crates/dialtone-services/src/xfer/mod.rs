//! File transfer: per-connection slots and the engine that drives them.

mod engine;
mod state;

pub use engine::{TransferEngine, TransferLimits, TransferReport, XferError};
pub use state::{Direction, FailureReason, TransferSlots, TransferState, TransferStatus};
