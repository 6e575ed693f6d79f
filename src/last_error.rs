//! Process-wide record of the most recent creation failure
//!
//! Session creation returns a rich [`PtyCreationError`](crate::PtyCreationError)
//! directly. This is only a fallback for embeddings whose call boundary can't
//! carry that value back.

use std::sync::{Mutex, PoisonError};

type Slot = Mutex<Option<String>>;

static LAST_ERROR: Slot = Mutex::new(None);

/// Message of the most recent failed session creation, if any
pub fn last_error() -> Option<String> {
    load(&LAST_ERROR)
}

pub(crate) fn record(message: String) {
    store(&LAST_ERROR, message);
}

fn load(slot: &Slot) -> Option<String> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn store(slot: &Slot, message: String) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_replaces_previous() {
        let slot: Slot = Mutex::new(None);
        assert_eq!(load(&slot), None);

        store(&slot, "first".to_string());
        store(&slot, "Failed to fork: out of memory".to_string());
        assert_eq!(load(&slot).as_deref(), Some("Failed to fork: out of memory"));
    }

    #[test]
    fn test_record_is_visible_through_last_error() {
        // Nothing else in this test binary records creation failures
        record("Failed to open PTY master: too many open files".to_string());
        assert_eq!(
            last_error().as_deref(),
            Some("Failed to open PTY master: too many open files")
        );
    }
}
