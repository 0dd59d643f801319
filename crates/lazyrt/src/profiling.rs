//! Counters and timed scopes recorded by a [`LazyContext`](crate::LazyContext).
//!
//! Each context owns its own [`Counters`], so independent contexts (for example parallel
//! tests) never observe each other's events. Counter names are static strings such as
//! `"TrimIrGraph"`; timed scopes add one event per guard plus the elapsed wall time.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Accumulated statistics for a single counter or timed scope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterStats {
    pub count: u64,
    #[serde(serialize_with = "serialize_duration_us")]
    pub total: Duration,
}

fn serialize_duration_us<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u128(duration.as_micros())
}

/// Thread-safe event table.
#[derive(Debug, Default)]
pub struct Counters {
    entries: Mutex<BTreeMap<&'static str, CounterStats>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `by` events to `name` without timing information.
    pub fn increment(&self, name: &'static str, by: u64) {
        let mut entries = self.entries.lock().expect("profiling counters poisoned");
        entries.entry(name).or_default().count += by;
    }

    /// Starts a timed scope that records one event and its duration when dropped.
    #[must_use = "the scope records its duration when dropped"]
    pub fn timed(&self, name: &'static str) -> ScopeGuard<'_> {
        ScopeGuard {
            counters: self,
            name,
            start: Instant::now(),
        }
    }

    /// Number of events recorded under `name`.
    pub fn count(&self, name: &str) -> u64 {
        let entries = self.entries.lock().expect("profiling counters poisoned");
        entries.get(name).map(|stats| stats.count).unwrap_or(0)
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        let entries = self.entries.lock().expect("profiling counters poisoned");
        ProfileSnapshot {
            entries: entries
                .iter()
                .map(|(name, stats)| (name.to_string(), *stats))
                .collect(),
        }
    }

    pub fn reset(&self) {
        self.entries
            .lock()
            .expect("profiling counters poisoned")
            .clear();
    }

    fn record(&self, name: &'static str, elapsed: Duration) {
        let mut entries = self.entries.lock().expect("profiling counters poisoned");
        let stats = entries.entry(name).or_default();
        stats.count += 1;
        stats.total += elapsed;
    }
}

/// Guard returned by [`Counters::timed`].
pub struct ScopeGuard<'a> {
    counters: &'a Counters,
    name: &'static str,
    start: Instant,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.counters.record(self.name, self.start.elapsed());
    }
}

/// Point-in-time copy of a counter table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileSnapshot {
    pub entries: BTreeMap<String, CounterStats>,
}

impl ProfileSnapshot {
    pub fn count(&self, name: &str) -> u64 {
        self.entries.get(name).map(|stats| stats.count).unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_scope_counts_once_per_guard() {
        let counters = Counters::new();
        {
            let _scope = counters.timed("IrValueTensorToDataHandle");
        }
        {
            let _scope = counters.timed("IrValueTensorToDataHandle");
        }
        counters.increment("TrimIrGraph", 1);
        assert_eq!(counters.count("IrValueTensorToDataHandle"), 2);
        assert_eq!(counters.snapshot().count("TrimIrGraph"), 1);
        counters.reset();
        assert_eq!(counters.count("TrimIrGraph"), 0);
    }
}
