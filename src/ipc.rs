//! Process-wide named IPC primitives built on POSIX shared memory.

pub mod mpsc;
pub mod sem;
pub mod shmem;
