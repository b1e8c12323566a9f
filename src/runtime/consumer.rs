//! Consumer task: drains the expected number of records from the wire.
//!
//! The consumer takes no lock — the channel itself serializes delivery.
//! Each cycle performs one blocking receive, logs the record, and sleeps
//! the configured delay. With an unbounded receive, fewer arrivals than
//! expected leave the task blocked forever; that liveness gap is part of
//! the modeled design, and runs that cannot tolerate it set a deadline.

use std::thread;
use std::time::Duration;

use super::{Config, WireReceiver};
use crate::ipc::mpsc::Timeout;
use crate::ipc::shmem::Creator;
use crate::protocol::Record;
use crate::trace::{error, info, warn};

/// What the consumer observed over a run.
#[derive(Debug, Default)]
pub struct ConsumerOutcome {
    /// Every record received, in delivery order.
    pub records: Vec<Record>,
    /// Records whose class did not match the configured one. A protocol
    /// violation in this single-class design; counted, logged, and still
    /// consuming a receive cycle.
    pub class_mismatches: u32,
}

/// The single consumer task. Owns the channel's read end; hands it back
/// at the end of the run so the coordinator controls teardown timing.
pub struct Consumer {
    wire: WireReceiver<Creator>,
    expected: u32,
    class: u64,
    delay: Duration,
    timeout: Timeout,
}

impl Consumer {
    /// Builds the consumer around the read end created by the coordinator.
    #[must_use]
    pub fn new(wire: WireReceiver<Creator>, expected: u32, cfg: &Config) -> Self {
        Self {
            wire,
            expected,
            class: cfg.class,
            delay: cfg.recv_delay,
            timeout: cfg.recv_timeout.into(),
        }
    }

    /// Drains `expected` records, then returns the channel handle and the
    /// collected outcome.
    pub fn run(self) -> (WireReceiver<Creator>, ConsumerOutcome) {
        let mut outcome = ConsumerOutcome::default();

        for seq in 1..=self.expected {
            let Some(record) = self.wire.recv_blocking(self.timeout) else {
                warn!(
                    seq,
                    expected = self.expected,
                    "receive deadline expired before all records arrived"
                );
                break;
            };

            if record.class != self.class {
                outcome.class_mismatches += 1;
                error!(
                    expected = self.class,
                    got = record.class,
                    "record with unexpected class"
                );
            }

            info!(
                seq,
                text = %record.text(),
                timestamp = record.timestamp,
                "received"
            );
            outcome.records.push(record);

            thread::sleep(self.delay);
        }

        info!(received = outcome.records.len(), "consumer done");
        (self.wire, outcome)
    }
}
