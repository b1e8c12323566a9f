//! Producer task: contends for the medium lock, sends one record per
//! successful acquisition.
//!
//! Each cycle moves through the same phases: idle, awaiting the lock with
//! a randomized bounded wait, sending on the wire, then a cooldown while
//! still holding the lock. A timed-out wait does not consume an iteration;
//! the task retries the same cycle with a fresh random deadline, which
//! naturally desynchronizes competing producers. Retries are unbounded —
//! there is no backoff growth and no attempt cap, so a lock that is never
//! released keeps the task alive indefinitely.

use std::thread;
use std::time::Duration;

use minstant::Instant;
use rand::Rng;

use super::{Config, WireSender};
use crate::ipc::sem::{Acquire, Semaphore};
use crate::ipc::shmem::Opener;
use crate::protocol::Record;
use crate::trace::{debug, error, info, warn};

/// Counters a producer reports back to the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerStats {
    /// Task id, for labeling only.
    pub id: u32,
    /// Records successfully handed to the channel.
    pub sent: u32,
    /// Lock waits that expired and were retried.
    pub timeouts: u32,
    /// Send attempts rejected by the transport.
    pub send_failures: u32,
    /// Non-fatal release failures.
    pub release_failures: u32,
}

/// One producer task. Owns its lock and channel handles for the whole run.
pub struct Producer {
    id: u32,
    lock: Semaphore<Opener>,
    wire: WireSender<Opener>,
    iters: u32,
    wait_min: Duration,
    wait_max: Duration,
    work_delay: Duration,
    class: u64,
}

impl Producer {
    /// Builds a producer with handles opened by the coordinator.
    #[must_use]
    pub fn new(id: u32, lock: Semaphore<Opener>, wire: WireSender<Opener>, cfg: &Config) -> Self {
        Self {
            id,
            lock,
            wire,
            iters: cfg.iters,
            wait_min: cfg.wait_min,
            wait_max: cfg.wait_max,
            work_delay: cfg.work_delay,
            class: cfg.class,
        }
    }

    /// Task id, for labeling only.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Draws a fresh uniform wait from `[wait_min, wait_max]`.
    fn draw_wait(&self) -> Duration {
        let span = self.wait_max.saturating_sub(self.wait_min);
        if span.is_zero() {
            return self.wait_min;
        }
        let offset = rand::thread_rng().gen_range(0..=span.as_millis() as u64);
        self.wait_min + Duration::from_millis(offset)
    }

    /// Runs the task to completion: exactly `iters` successful send cycles.
    ///
    /// The lock is released unconditionally after every acquisition, even
    /// when the send failed. A failed send does not consume the iteration;
    /// a failed release is logged and the loop continues.
    pub fn run(self) -> ProducerStats {
        let mut stats = ProducerStats {
            id: self.id,
            ..ProducerStats::default()
        };

        let mut completed = 0;
        while completed < self.iters {
            let wait = self.draw_wait();
            debug!(
                id = self.id,
                wait_ms = wait.as_millis() as u64,
                "attempting to acquire medium lock"
            );

            match self.lock.acquire_before(Instant::now() + wait) {
                Acquire::TimedOut => {
                    stats.timeouts += 1;
                    info!(id = self.id, "lock wait timed out, retrying");
                    continue; // same iteration, fresh random deadline
                }
                Acquire::Acquired => {}
            }

            let record = Record::new(
                self.class,
                &format!("random message from sender {}", self.id),
            );
            info!(id = self.id, seq = completed + 1, "acquired lock, sending");

            let sent = match self.wire.send(record) {
                Ok(()) => true,
                Err(err) => {
                    stats.send_failures += 1;
                    error!(id = self.id, error = %err, "send failed, iteration will rerun");
                    false
                }
            };

            // Simulated work while holding the medium.
            thread::sleep(self.work_delay);

            if let Err(err) = self.lock.release() {
                stats.release_failures += 1;
                warn!(id = self.id, error = %err, "release failed");
            }

            if sent {
                stats.sent += 1;
                completed += 1;
            }
        }

        info!(id = self.id, sent = stats.sent, timeouts = stats.timeouts, "producer done");
        stats
    }
}
