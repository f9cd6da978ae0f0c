#![allow(dead_code)]

use std::sync::Arc;

use kestrel_kernel::Kernel;
use kestrel_platform::{Clock, ManualClock, MemoryStorage};
use kestrel_types::KernelConfig;
use kestrel_types::config::SecurityConfig;

/// Default configuration with hashing cheap enough for tests.
pub fn config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.security = SecurityConfig {
        hash_memory_kib: 8,
        hash_iterations: 1,
        hash_parallelism: 1,
    };
    config
}

pub fn boot(storage: &MemoryStorage) -> Kernel {
    boot_with_clock(storage, Arc::new(ManualClock::default()))
}

pub fn boot_with_clock(storage: &MemoryStorage, clock: Arc<ManualClock>) -> Kernel {
    let clock: Arc<dyn Clock> = clock;
    match Kernel::boot(config(), Box::new(storage.clone()), clock) {
        Ok(kernel) => kernel,
        Err(e) => panic!("boot failed: {e}"),
    }
}

/// Run a line that must succeed and return its output.
pub fn run(kernel: &mut Kernel, line: &str) -> Vec<String> {
    match kernel.execute(line) {
        Ok(outcome) => outcome.output,
        Err(e) => panic!("'{line}' failed: {e}"),
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
