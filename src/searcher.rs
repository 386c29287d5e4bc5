//! State-selection policies.
//!
//! A searcher never returns a state that was removed, and `update` is
//! called exactly once per batch of added/removed states the executor
//! produced in a step.

use crate::state::StateId;
use rand::prelude::*;
use strum::{EnumString, VariantNames};

pub trait Searcher {
    fn select(&mut self) -> Option<StateId>;
    fn update(&mut self, added: &[StateId], removed: &[StateId]);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum SearcherKind {
    DepthFirst,
    Random,
    Interleaved,
}

pub fn new_searcher(kind: SearcherKind, seed: u64) -> Box<dyn Searcher> {
    match kind {
        SearcherKind::DepthFirst => Box::new(DepthFirstSearcher::default()),
        SearcherKind::Random => Box::new(RandomSearcher::new(seed)),
        SearcherKind::Interleaved => Box::new(InterleavedSearcher::new(vec![
            Box::new(DepthFirstSearcher::default()),
            Box::new(RandomSearcher::new(seed)),
        ])),
    }
}

/// Always continues the most recently added state.
#[derive(Default)]
pub struct DepthFirstSearcher {
    stack: Vec<StateId>,
}

impl Searcher for DepthFirstSearcher {
    fn select(&mut self) -> Option<StateId> {
        self.stack.last().copied()
    }

    fn update(&mut self, added: &[StateId], removed: &[StateId]) {
        self.stack.retain(|id| !removed.contains(id));
        self.stack.extend_from_slice(added);
    }
}

/// Uniformly random among live states.
pub struct RandomSearcher {
    states: Vec<StateId>,
    rng: StdRng,
}

impl RandomSearcher {
    pub fn new(seed: u64) -> Self {
        Self {
            states: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Searcher for RandomSearcher {
    fn select(&mut self) -> Option<StateId> {
        if self.states.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.states.len());
        Some(self.states[index])
    }

    fn update(&mut self, added: &[StateId], removed: &[StateId]) {
        self.states.retain(|id| !removed.contains(id));
        self.states.extend_from_slice(added);
    }
}

/// Round-robins between sub-policies; every policy observes every update.
pub struct InterleavedSearcher {
    inner: Vec<Box<dyn Searcher>>,
    next: usize,
}

impl InterleavedSearcher {
    pub fn new(inner: Vec<Box<dyn Searcher>>) -> Self {
        assert!(!inner.is_empty());
        Self { inner, next: 0 }
    }
}

impl Searcher for InterleavedSearcher {
    fn select(&mut self) -> Option<StateId> {
        let n = self.inner.len();
        for offset in 0..n {
            let index = (self.next + offset) % n;
            if let Some(choice) = self.inner[index].select() {
                self.next = (index + 1) % n;
                return Some(choice);
            }
        }
        None
    }

    fn update(&mut self, added: &[StateId], removed: &[StateId]) {
        for searcher in &mut self.inner {
            searcher.update(added, removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_first_prefers_latest() {
        let mut searcher = DepthFirstSearcher::default();
        searcher.update(&[1, 2, 3], &[]);
        assert_eq!(searcher.select(), Some(3));
        searcher.update(&[], &[3]);
        assert_eq!(searcher.select(), Some(2));
        searcher.update(&[4], &[2]);
        assert_eq!(searcher.select(), Some(4));
    }

    #[test]
    fn removed_states_never_come_back() {
        let mut searcher = RandomSearcher::new(7);
        searcher.update(&[1, 2, 3, 4], &[]);
        searcher.update(&[], &[2, 4]);
        for _ in 0..50 {
            let chosen = searcher.select().unwrap();
            assert!(chosen == 1 || chosen == 3);
        }
    }
}
