//! Shared-medium access control simulation.
//!
//! Models a transmission medium shared by multiple producers and a single
//! consumer. Access to the medium is arbitrated by a named counting lock
//! ([`ipc::sem::Semaphore`]) with randomized bounded-wait acquisition, while
//! the payloads themselves travel out-of-band over a named FIFO record queue
//! ([`ipc::mpsc`]). Both primitives live in POSIX shared memory, so every
//! participant that knows the well-known name can attach — threads in one
//! process (as the demo and tests do) or independent processes.
//!
//! - [`ipc`] — named shared-memory primitives (lock, queue)
//! - [`protocol`] — the fixed-layout wire record and well-known names
//! - [`runtime`] — producer/consumer tasks and the coordinator
//! - [`trace`] — optional tracing setup (enable with `--features tracing`)

pub mod ipc;
pub mod protocol;
pub(crate) mod ring;
pub mod runtime;
pub mod trace;
