//! Simulation runtime: producer/consumer tasks and the coordinator that
//! owns shared-resource lifecycle.

pub mod consumer;
pub mod coordinator;
pub mod producer;

use std::time::Duration;

use crate::ipc::mpsc::{Receiver, Sender};
use crate::ipc::shmem::ShmPath;
use crate::protocol::{
    MEDIUM_CLASS, QUEUE_CAPACITY, Record, WIRE_ID, WIRE_TOKEN, medium_lock_path,
};

pub use consumer::ConsumerOutcome;
pub use coordinator::{RunError, RunReport, run};
pub use producer::ProducerStats;

/// Write end of the record channel.
pub type WireSender<Mode> = Sender<Record, QUEUE_CAPACITY, Mode>;
/// Read end of the record channel.
pub type WireReceiver<Mode> = Receiver<Record, QUEUE_CAPACITY, Mode>;

/// Simulation configuration, passed to [`coordinator::run`].
///
/// The defaults reproduce the reference scenario: two producers, five
/// records each, a capacity-1 lock, and second-scale delays. Tests shrink
/// the durations and use private resource names.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of producer tasks.
    pub senders: u32,
    /// Successful send cycles each producer must complete.
    pub iters: u32,
    /// Initial permit count of the medium lock (1 = mutual exclusion).
    pub initial_permits: u32,
    /// Lower bound of the randomized per-attempt lock wait.
    pub wait_min: Duration,
    /// Upper bound of the randomized per-attempt lock wait.
    pub wait_max: Duration,
    /// Simulated work delay a producer holds the lock for after sending.
    pub work_delay: Duration,
    /// Delay the consumer inserts between received records.
    pub recv_delay: Duration,
    /// Grace delay between the last join and resource teardown.
    pub grace_delay: Duration,
    /// Per-record receive deadline for the consumer. `None` reproduces the
    /// reference behavior: an unbounded blocking receive that hangs if the
    /// expected records never arrive. Tests bound it.
    pub recv_timeout: Option<Duration>,
    /// Name of the medium access lock.
    pub lock_name: ShmPath,
    /// Token the channel name is derived from.
    pub channel_token: String,
    /// Small integer combined with the token for name derivation.
    pub channel_id: u32,
    /// Record class discriminant for this run.
    pub class: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            senders: 2,
            iters: 5,
            initial_permits: 1,
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(5),
            work_delay: Duration::from_secs(1),
            recv_delay: Duration::from_secs(1),
            grace_delay: Duration::from_secs(1),
            recv_timeout: None,
            lock_name: medium_lock_path(),
            channel_token: WIRE_TOKEN.to_string(),
            channel_id: WIRE_ID,
            class: MEDIUM_CLASS,
        }
    }
}
