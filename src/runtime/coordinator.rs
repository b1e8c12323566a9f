//! Coordinator: owns shared-resource lifecycle and task orchestration.
//!
//! One [`run`] call reproduces the full scenario: remove stale names,
//! create the medium lock and the record channel, spawn the consumer and
//! N producers with their handles injected at spawn time, join everything
//! in any order, wait the grace delay, then tear the named resources down.
//! After `run` returns, opening the lock or channel by name fails with
//! `NotFound`.

use std::thread;

use thiserror::Error;

use super::consumer::{Consumer, ConsumerOutcome};
use super::producer::{Producer, ProducerStats};
use super::{Config, WireReceiver, WireSender};
use crate::ipc::mpsc::{self, QueueError};
use crate::ipc::sem::{self, SemError, Semaphore};
use crate::ipc::shmem::{Creator, Opener, ShmError};
use crate::protocol::channel_path;
use crate::trace::{debug, error, info};

/// Fatal coordinator errors. Resource creation failures abort the run
/// before any task is spawned; task-local failures never surface here.
#[derive(Debug, Error)]
pub enum RunError {
    /// The configuration cannot produce a meaningful run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Medium lock setup failed.
    #[error("medium lock setup failed: {0}")]
    Lock(#[from] SemError),
    /// Record channel setup failed.
    #[error("record channel setup failed: {0}")]
    Channel(#[from] QueueError),
    /// The channel name could not be derived from the configured token.
    #[error("channel name derivation failed: {0}")]
    ChannelName(#[from] ShmError),
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunReport {
    /// Records the run was expected to deliver.
    pub expected: u32,
    /// Everything the consumer received, in delivery order.
    pub records: Vec<crate::protocol::Record>,
    /// Class mismatches the consumer observed (zero in a healthy run).
    pub class_mismatches: u32,
    /// Per-producer counters, in spawn order.
    pub producers: Vec<ProducerStats>,
}

impl RunReport {
    /// Whether every expected record arrived.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.records.len() == self.expected as usize
    }
}

fn validate(config: &Config) -> Result<(), RunError> {
    if config.initial_permits == 0 {
        return Err(RunError::InvalidConfig(
            "initial_permits must be at least 1",
        ));
    }
    if config.wait_max.is_zero() {
        return Err(RunError::InvalidConfig("wait_max must be non-zero"));
    }
    if config.wait_min > config.wait_max {
        return Err(RunError::InvalidConfig(
            "wait_min must not exceed wait_max",
        ));
    }
    Ok(())
}

/// Runs the full simulation described by `config`.
///
/// # Errors
///
/// Only setup can fail: configuration validation, stale-name cleanup, or
/// creation/opening of the lock and channel. Once tasks are spawned the
/// coordinator observes task termination, not task errors; a panicked
/// task is logged and the remaining tasks are still joined.
pub fn run(config: Config) -> Result<RunReport, RunError> {
    validate(&config)?;

    let wire_path = channel_path(&config.channel_token, config.channel_id)?;
    let expected = config
        .senders
        .checked_mul(config.iters)
        .ok_or(RunError::InvalidConfig("senders * iters overflows"))?;

    info!(
        senders = config.senders,
        iters = config.iters,
        expected,
        lock = %config.lock_name,
        wire = %wire_path,
        "run starting"
    );

    // A crashed previous run may have leaked names; removal is idempotent.
    sem::unlink(&config.lock_name)?;
    mpsc::unlink(&wire_path)?;

    // The coordinator holds the Creator handles purely for lifecycle; it
    // never contends for the lock or touches the wire.
    let lock_owner = Semaphore::<Creator>::create(config.lock_name.clone(), config.initial_permits)?;
    let wire_owner = WireReceiver::<Creator>::create(wire_path.clone())?;

    // Open every task handle up front so a failure aborts the run before
    // any thread exists.
    let mut producer_parts = Vec::with_capacity(config.senders as usize);
    for id in 1..=config.senders {
        let lock = Semaphore::<Opener>::open(config.lock_name.clone())?;
        let wire = WireSender::<Opener>::open(wire_path.clone())?;
        producer_parts.push(Producer::new(id, lock, wire, &config));
    }

    debug!("spawning consumer");
    let consumer = Consumer::new(wire_owner, expected, &config);
    let consumer_handle = thread::Builder::new()
        .name("aether-recv".into())
        .spawn(move || consumer.run())
        .expect("failed to spawn consumer thread");

    let mut producer_handles = Vec::with_capacity(producer_parts.len());
    for producer in producer_parts {
        let id = producer.id();
        debug!(id, "spawning producer");
        let handle = thread::Builder::new()
            .name(format!("aether-send-{id}"))
            .spawn(move || producer.run())
            .expect("failed to spawn producer thread");
        producer_handles.push((id, handle));
    }

    // Join in any order; a panicked task does not abort waiting on the rest.
    let mut producers = Vec::with_capacity(producer_handles.len());
    for (id, handle) in producer_handles {
        match handle.join() {
            Ok(stats) => producers.push(stats),
            Err(_) => {
                error!(id, "producer thread panicked");
            }
        }
    }

    let (wire_owner, outcome) = match consumer_handle.join() {
        Ok((wire, outcome)) => (Some(wire), outcome),
        Err(_) => {
            error!("consumer thread panicked");
            (None, ConsumerOutcome::default())
        }
    };

    // Grace delay before tearing down the shared names.
    thread::sleep(config.grace_delay);

    info!("destroying medium lock and record channel");
    drop(lock_owner);
    drop(wire_owner);

    info!(
        received = outcome.records.len(),
        expected,
        "run complete"
    );

    Ok(RunReport {
        expected,
        records: outcome.records,
        class_mismatches: outcome.class_mismatches,
        producers,
    })
}
