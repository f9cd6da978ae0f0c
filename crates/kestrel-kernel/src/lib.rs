//! The Kestrel kernel.
//!
//! [`Kernel`] owns the filesystem, accounts, sessions, shell state and
//! background jobs, and persists all of it through a
//! [`StorageBackend`](kestrel_platform::StorageBackend) after every
//! mutating request. Commands run through the shell's registry; whatever
//! they cannot finish alone comes back as an effect the kernel resolves,
//! or hands to the caller as prompts to answer with [`Kernel::resume`].
//!
//! [`Gateway`] exposes the same kernel as `call(domain, method, args)` over
//! JSON values for front ends without access to the typed API.

mod audit;
pub mod kernel;
mod runner;
pub mod state;
pub mod syscall;
mod world;

/// The kernel and its request results.
pub use kernel::{JobReport, Kernel, KernelResult, Outcome};
/// What survives a reboot.
pub use state::{PersistedState, STATE_VERSION, SessionSnapshot};
/// Name-based access to the kernel.
pub use syscall::{Gateway, Response};
