//! The counterexample cache.
//!
//! Maps constraint sets to a known satisfying assignment (or to "no
//! assignment exists"). Truth queries reduce to asking for a witness of
//! the constraints plus the negated proposition; on a hit the answer comes
//! from local evaluation instead of a solver call.

use super::caching::QueryKey;
use super::{Query, SolverError, SolverImpl, SolverResult};
use crate::constraints::IndependentSet;
use crate::expr::{ArrayRef, Assignment, BitVec, Expr, ExprRef};
use crate::stats;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

pub struct CexCacheSolver {
    inner: Box<dyn SolverImpl>,
    cache: HashMap<QueryKey, Option<Rc<Assignment>>>,
}

impl CexCacheSolver {
    pub fn new(inner: Box<dyn SolverImpl>) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
        }
    }

    /// A satisfying assignment for the conjunction `set`, consulting the
    /// cache first. `None` means proven unsatisfiable.
    fn assignment_for(
        &mut self,
        set: &[ExprRef],
        factors: Option<&[IndependentSet]>,
    ) -> SolverResult<Option<Rc<Assignment>>> {
        let key = QueryKey::of_set(set);
        if let Some(hit) = self.cache.get(&key) {
            stats::CEX_CACHE_HITS.inc();
            debug_assert!(
                hit.as_ref()
                    .map_or(true, |a| a.satisfies(set) == Some(true)),
                "cached witness no longer satisfies its key"
            );
            return Ok(hit.clone());
        }
        let arrays = footprint(set);
        let query = Query {
            constraints: set,
            factors,
            expr: Expr::bool_const(false),
        };
        let result = self
            .inner
            .compute_initial_values(&query, &arrays)?
            .map(|mut a| {
                a.default_zero = true;
                Rc::new(a)
            });
        self.cache.insert(key, result.clone());
        Ok(result)
    }
}

fn footprint(set: &[ExprRef]) -> Vec<ArrayRef> {
    let mut merged = IndependentSet::default();
    for e in set {
        merged.merge(&IndependentSet::footprint_of(e));
    }
    merged
        .arrays()
        .into_iter()
        .filter(|a| a.is_symbolic())
        .collect()
}

impl SolverImpl for CexCacheSolver {
    fn name(&self) -> &'static str {
        "cex-cache"
    }

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let mut set = query.constraints.to_vec();
        set.push(Expr::logical_not(query.expr.clone()));
        // Valid iff the constraints plus the negation have no model.
        Ok(self.assignment_for(&set, None)?.is_none())
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec> {
        let witness = self
            .assignment_for(query.constraints, query.factors)?
            .ok_or_else(|| SolverError::Backend("value query over an infeasible path".into()))?;
        witness
            .evaluate(&query.expr)
            .ok_or_else(|| SolverError::Backend("unevaluable value query".into()))
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        let mut set = query.constraints.to_vec();
        let factors = if query.expr.is_false() {
            query.factors
        } else {
            set.push(Expr::logical_not(query.expr.clone()));
            None
        };
        match self.assignment_for(&set, factors)? {
            None => Ok(None),
            Some(shared) => {
                let mut assignment = (*shared).clone();
                for array in arrays {
                    if assignment.bytes_for(array).is_none() {
                        assignment.bind(array, vec![0; array.size() as usize]);
                    }
                }
                Ok(Some(assignment))
            }
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_timeout(timeout);
    }
}
