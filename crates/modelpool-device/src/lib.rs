//! Device capability reporting and memory accounting for modelpool.
//!
//! This crate is the device/memory boundary of the subsystem: it exposes
//! the [`MemoryReporter`] query trait consulted before every allocation
//! decision, and the [`DeviceLedger`] that enforces the per-device
//! capacity invariant and tracks which components are pinned by in-flight
//! sessions.

pub mod capability;
pub mod ledger;
pub mod reporter;

pub use capability::{DeviceCapabilities, simulated_devices};
pub use ledger::{DeviceLedger, DeviceUsage};
pub use reporter::{DeviceMemory, MemoryReporter};
