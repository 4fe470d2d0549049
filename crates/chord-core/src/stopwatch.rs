//! Cross-process elapsed-time pairing.
//!
//! Two independent events, possibly in different workers, measure the time
//! between them by signalling the same id twice: the first signal records a
//! start timestamp, the second consumes it. A third signal therefore behaves
//! as a fresh start.
//!
//! Entries for ids that never see a second signal are kept forever; the
//! source behavior defines no expiry, so unmatched ids accumulate.

use std::collections::HashMap;

/// Process-wide id → start-timestamp table. Owned by the manager; workers
/// reach it only through the IPC router.
#[derive(Debug, Default)]
pub struct StopwatchRegistry {
    entries: HashMap<String, u64>,
}

impl StopwatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or consume a signal for `id` at `now_ms` (epoch milliseconds).
    ///
    /// Returns `None` when this signal started a measurement, or
    /// `Some(start_ms)` when it closed one (the entry is removed).
    pub fn signal(&mut self, id: &str, now_ms: u64) -> Option<u64> {
        match self.entries.remove(id) {
            Some(start) => Some(start),
            None => {
                self.entries.insert(id.to_string(), now_ms);
                None
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}
