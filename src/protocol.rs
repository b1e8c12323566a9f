//! Wire protocol: the fixed-layout record and the well-known names all
//! participants derive without a handshake.

use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ipc::shmem::{SharedMemorySafe, ShmError, ShmPath};

/// Fixed capacity of a record's text payload, in bytes.
pub const TEXT_CAP: usize = 200;

/// Record class used for medium payloads. A single class is in use; the
/// field exists so the wire format can carry others.
pub const MEDIUM_CLASS: u64 = 1;

/// Well-known name of the medium access lock.
pub const MEDIUM_LOCK_NAME: &str = "/aether-medium-lock";

/// Well-known token from which the channel name is derived.
pub const WIRE_TOKEN: &str = "aether-wire";

/// Fixed channel discriminator combined with the token (the `ftok`-style
/// project id).
pub const WIRE_ID: u32 = 65;

/// Queue depth of the record channel. Bounds in-flight records the way a
/// host message queue would; senders see a transport error beyond it.
pub const QUEUE_CAPACITY: usize = 64;

/// The well-known lock name as a validated path.
///
/// # Panics
///
/// Never panics — the static name is valid by construction.
#[must_use]
pub fn medium_lock_path() -> ShmPath {
    ShmPath::new(MEDIUM_LOCK_NAME).expect("static path is valid")
}

/// Derives the channel name from a shared token and small integer id.
///
/// Deterministic: every participant that knows `(token, id)` computes the
/// identical name with no explicit handshake, mirroring SysV `ftok` key
/// derivation.
///
/// # Errors
///
/// [`ShmError::InvalidPath`] if the combination does not form a valid
/// shared memory name (e.g. the token contains `/`).
pub fn channel_path(token: &str, id: u32) -> Result<ShmPath, ShmError> {
    ShmPath::new(format!("/{token}-{id:02x}"))
}

/// Seconds since the Unix epoch, saturating at zero for a pre-epoch clock.
#[must_use]
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// The fixed-shape payload exchanged over the channel.
///
/// Layout is stable (`#[repr(C)]`, 216 bytes): an 8-byte class
/// discriminant, a NUL-padded 200-byte text buffer, and an epoch-seconds
/// timestamp. Created by a producer at send time, consumed exactly once
/// by the receiver.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Record {
    /// Class discriminant; delivery is FIFO within one class.
    pub class: u64,
    /// Labeled message text, NUL-padded to capacity.
    pub text: [u8; TEXT_CAP],
    /// Seconds since the Unix epoch at creation time.
    pub timestamp: u64,
}

// SAFETY: repr(C), fixed-size, pointer-free; the record is immutable after
// send, so concurrent visibility needs no further synchronization.
unsafe impl SharedMemorySafe for Record {}

impl Record {
    /// Builds a record for `class`, stamping it with the current time.
    ///
    /// Text longer than [`TEXT_CAP`] bytes is truncated.
    #[must_use]
    pub fn new(class: u64, text: &str) -> Self {
        let mut buf = [0u8; TEXT_CAP];
        let bytes = text.as_bytes();
        let len = bytes.len().min(TEXT_CAP);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            class,
            text: buf,
            timestamp: unix_timestamp(),
        }
    }

    /// The text payload up to the first NUL byte.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        let end = self
            .text
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TEXT_CAP);
        String::from_utf8_lossy(&self.text[..end])
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("class", &self.class)
            .field("text", &self.text())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_stable() {
        assert_eq!(std::mem::size_of::<Record>(), 216);
        assert_eq!(std::mem::align_of::<Record>(), 8);
    }

    #[test]
    fn record_text_roundtrip() {
        let rec = Record::new(MEDIUM_CLASS, "random message from sender 2");
        assert_eq!(rec.class, MEDIUM_CLASS);
        assert_eq!(rec.text(), "random message from sender 2");
    }

    #[test]
    fn record_text_truncates_at_capacity() {
        let long = "x".repeat(TEXT_CAP + 50);
        let rec = Record::new(MEDIUM_CLASS, &long);
        assert_eq!(rec.text().len(), TEXT_CAP);
    }

    #[test]
    fn record_timestamp_is_current() {
        let before = unix_timestamp();
        let rec = Record::new(MEDIUM_CLASS, "t");
        assert!(rec.timestamp >= before);
        assert!(rec.timestamp <= unix_timestamp());
    }

    #[test]
    fn channel_path_is_deterministic() {
        let a = channel_path(WIRE_TOKEN, WIRE_ID).unwrap();
        let b = channel_path(WIRE_TOKEN, WIRE_ID).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "/aether-wire-41");
    }

    #[test]
    fn channel_path_rejects_slashed_tokens() {
        assert!(channel_path("bad/token", WIRE_ID).is_err());
    }

    #[test]
    fn well_known_names_are_valid() {
        let _ = medium_lock_path();
        assert!(channel_path(WIRE_TOKEN, WIRE_ID).is_ok());
    }
}
