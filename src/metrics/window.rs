use chrono::Utc;
use parking_lot::Mutex;

use super::snapshot::StatsSnapshot;
use super::Sample;

// ─── Configuration ───────────────────────────────────────────────

/// How many of the most recent samples the server keeps.
pub const WINDOW_CAPACITY: usize = 1024;

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe fixed-capacity ring of recent samples.
/// The request loop calls `push()`, the publisher calls `snapshot()`.
///
/// Storage is allocated once; when full, every push overwrites the
/// oldest sample.
pub struct SampleWindow {
    inner: Mutex<Ring>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Ring {
    samples: Box<[f64]>,
    // Slot the next push writes to
    head: usize,
    // Valid samples, never above samples.len()
    count: usize,
}

// ─── SampleWindow impl ───────────────────────────────────────────

impl SampleWindow {
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }

    /// Window holding at most `capacity` samples.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "sample window capacity must be non-zero");
        Self {
            inner: Mutex::new(Ring {
                samples: vec![0.0; capacity].into_boxed_slice(),
                head: 0,
                count: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store one reading. O(1); never fails.
    pub fn push(&self, value: Sample) {
        self.inner.lock().push(value);
    }

    /// Summarize the current contents, oldest to newest.
    /// Holds the window lock for the whole pass so no push can interleave.
    pub fn snapshot(&self) -> StatsSnapshot {
        let ring = self.inner.lock();
        StatsSnapshot::from_samples(ring.iter_oldest_first(), Utc::now())
    }
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Ring impl ───────────────────────────────────────────────────

impl Ring {
    fn push(&mut self, value: Sample) {
        let cap = self.samples.len();
        self.samples[self.head] = value;
        self.head = (self.head + 1) % cap;
        if self.count < cap {
            self.count += 1;
        }
    }

    /// Logical index `i` lives at `(head - count + i) mod cap`; adding
    /// `cap` first keeps the subtraction from underflowing.
    fn iter_oldest_first(&self) -> impl Iterator<Item = f64> + '_ {
        let cap = self.samples.len();
        let start = self.head + cap - self.count;
        (0..self.count).map(move |i| self.samples[(start + i) % cap])
    }
}
