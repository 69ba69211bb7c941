//! Local device: capacity tracking and downloaded ROM manifests

pub mod device;
pub mod ledger;

pub use device::*;
pub use ledger::*;
