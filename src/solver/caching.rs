//! Validity/truth memoization keyed on the canonicalized query.
//!
//! Interning makes a sorted vector of node identities a canonical key for
//! a constraint set, so two states that accumulated the same facts in a
//! different order still share cache entries.

use super::{Query, SolverImpl, SolverResult, Validity};
use crate::expr::{ArrayRef, Assignment, BitVec, ExprRef};
use crate::stats;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::Duration;

/// Canonical key of a `(constraints, expr)` pair. Holds the expressions
/// alive so the pointer identities stay stable for the cache's lifetime.
pub(crate) struct QueryKey {
    ptrs: Vec<usize>,
    _keepalive: Vec<ExprRef>,
}

impl QueryKey {
    pub(crate) fn new(constraints: &[ExprRef], expr: &ExprRef) -> Self {
        let mut ptrs: Vec<usize> = constraints.iter().map(|e| Rc::as_ptr(e) as usize).collect();
        ptrs.sort_unstable();
        ptrs.dedup();
        ptrs.push(usize::MAX);
        ptrs.push(Rc::as_ptr(expr) as usize);
        let mut keepalive = constraints.to_vec();
        keepalive.push(expr.clone());
        Self {
            ptrs,
            _keepalive: keepalive,
        }
    }

    pub(crate) fn of_set(set: &[ExprRef]) -> Self {
        let mut ptrs: Vec<usize> = set.iter().map(|e| Rc::as_ptr(e) as usize).collect();
        ptrs.sort_unstable();
        ptrs.dedup();
        Self {
            ptrs,
            _keepalive: set.to_vec(),
        }
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.ptrs == other.ptrs
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptrs.hash(state);
    }
}

pub struct CachingSolver {
    inner: Box<dyn SolverImpl>,
    truth: HashMap<QueryKey, bool>,
    validity: HashMap<QueryKey, Validity>,
}

impl CachingSolver {
    pub fn new(inner: Box<dyn SolverImpl>) -> Self {
        Self {
            inner,
            truth: HashMap::new(),
            validity: HashMap::new(),
        }
    }
}

impl SolverImpl for CachingSolver {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let key = QueryKey::new(query.constraints, &query.expr);
        if let Some(&hit) = self.truth.get(&key) {
            stats::QUERY_CACHE_HITS.inc();
            return Ok(hit);
        }
        if let Some(&validity) = self.validity.get(&key) {
            if validity == Validity::True {
                stats::QUERY_CACHE_HITS.inc();
                return Ok(true);
            }
        }
        let result = self.inner.compute_truth(query)?;
        self.truth.insert(key, result);
        Ok(result)
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        let key = QueryKey::new(query.constraints, &query.expr);
        if let Some(&hit) = self.validity.get(&key) {
            stats::QUERY_CACHE_HITS.inc();
            return Ok(hit);
        }
        let result = self.inner.compute_validity(query)?;
        self.validity.insert(key, result);
        let truth_key = QueryKey::new(query.constraints, &query.expr);
        self.truth.insert(truth_key, result == Validity::True);
        Ok(result)
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec> {
        self.inner.compute_value(query)
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        self.inner.compute_initial_values(query, arrays)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_timeout(timeout);
    }
}
