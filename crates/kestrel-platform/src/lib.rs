//! Host services the kernel depends on but does not own.
//!
//! The kernel never reads the wall clock or touches host storage directly;
//! it is handed a [`Clock`] and a [`StorageBackend`] at boot.

mod services;
mod storage;

pub use services::{Clock, HostClock, ManualClock};
pub use storage::{FileStorage, MemoryStorage, StorageBackend};
