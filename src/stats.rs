//! Process-wide statistics counters. Fetch-and-add only, safe to bump from
//! anywhere in the engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

pub static INSTRUCTIONS: Counter = Counter::new();
pub static FORKS: Counter = Counter::new();
pub static STATES_CREATED: Counter = Counter::new();
pub static STATES_TERMINATED: Counter = Counter::new();
pub static SOLVER_QUERIES: Counter = Counter::new();
pub static CEX_CACHE_HITS: Counter = Counter::new();
pub static QUERY_CACHE_HITS: Counter = Counter::new();
pub static INDEPENDENT_DROPPED: Counter = Counter::new();
pub static ALLOCATED_BYTES: Counter = Counter::new();

pub struct Summary;

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "instructions:      {}", INSTRUCTIONS.get())?;
        writeln!(f, "forks:             {}", FORKS.get())?;
        writeln!(f, "states created:    {}", STATES_CREATED.get())?;
        writeln!(f, "states terminated: {}", STATES_TERMINATED.get())?;
        writeln!(f, "solver queries:    {}", SOLVER_QUERIES.get())?;
        writeln!(f, "cex cache hits:    {}", CEX_CACHE_HITS.get())?;
        writeln!(f, "query cache hits:  {}", QUERY_CACHE_HITS.get())?;
        write!(f, "dropped constraints: {}", INDEPENDENT_DROPPED.get())
    }
}

/// Clears every counter; used by tests that assert on deltas.
pub fn reset_all() {
    for c in [
        &INSTRUCTIONS,
        &FORKS,
        &STATES_CREATED,
        &STATES_TERMINATED,
        &SOLVER_QUERIES,
        &CEX_CACHE_HITS,
        &QUERY_CACHE_HITS,
        &INDEPENDENT_DROPPED,
        &ALLOCATED_BYTES,
    ] {
        c.reset();
    }
}
