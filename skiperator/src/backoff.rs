//! Per-object exponential backoff for the error policy of the controllers.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use crate::utils::NamespacedName;

/// Tracks consecutive reconciliation failures per Application and derives the delay of the
/// next retry from it: `initial * 2^(failures - 1)`, capped at `max`.
///
/// Failures that retrying cannot fix are requeued after `max` right away.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    failures: Mutex<HashMap<NamespacedName, u32>>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            failures: Default::default(),
        }
    }

    /// Register a failed reconciliation and return the delay before the next attempt.
    pub fn next_delay(&self, key: &NamespacedName, temporary: bool) -> Duration {
        let failures = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.clone()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => return self.max,
        };
        if !temporary {
            return self.max;
        }
        let exponent = (failures - 1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Forget the failures of an object after a successful reconciliation.
    pub fn reset(&self, key: &NamespacedName) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    #[cfg(test)]
    pub fn failures(&self, key: &NamespacedName) -> u32 {
        self.failures
            .lock()
            .map(|f| f.get(key).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}
