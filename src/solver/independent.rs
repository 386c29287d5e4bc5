//! Query decomposition along independent element sets.
//!
//! Truth and value queries drop every constraint whose footprint is
//! disjoint from the proposition's closure. Initial-value queries solve
//! one sub-query per factor (or per batch of small factors) and compose
//! the per-array byte maps into one witness.

use super::{Query, SolverImpl, SolverResult, Validity};
use crate::constraints::IndependentSet;
use crate::expr::{ArrayRef, Assignment, BitVec, ExprRef};
use crate::stats;
use itertools::Itertools;
use log::trace;
use std::collections::HashMap;
use std::time::Duration;

use super::IndependentMode;

pub struct IndependentSolver {
    inner: Box<dyn SolverImpl>,
    mode: IndependentMode,
    batch_threshold: usize,
}

impl IndependentSolver {
    pub fn new(
        inner: Box<dyn SolverImpl>,
        mode: IndependentMode,
        batch_threshold: usize,
    ) -> Self {
        Self {
            inner,
            mode,
            batch_threshold,
        }
    }

    /// The constraints whose footprints transitively intersect the
    /// proposition's. Factors are mutually disjoint, so one scan suffices.
    fn relevant(&self, query: &Query) -> Vec<ExprRef> {
        let mut closure = IndependentSet::footprint_of(&query.expr);
        let owned;
        let factors: &[IndependentSet] = match query.factors {
            Some(f) => f,
            None => {
                owned = partition(query.constraints);
                &owned
            }
        };
        let mut result = Vec::new();
        for factor in factors {
            if closure.intersects(factor) {
                result.extend(factor.exprs.iter().cloned());
                closure.merge(factor);
            }
        }
        let dropped = query.constraints.len() - result.len();
        if dropped > 0 {
            stats::INDEPENDENT_DROPPED.add(dropped as u64);
            trace!(
                "independent: {} of {} constraints relevant",
                result.len(),
                query.constraints.len()
            );
        }
        result
    }

    fn solve_factor_group(
        &mut self,
        exprs: &[ExprRef],
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        let query = Query::new(exprs, crate::expr::Expr::bool_const(false));
        self.inner.compute_initial_values(&query, arrays)
    }
}

/// Partitions a plain constraint list into maximal independent sets.
fn partition(constraints: &[ExprRef]) -> Vec<IndependentSet> {
    let mut factors: Vec<IndependentSet> = Vec::new();
    for e in constraints {
        let mut current = IndependentSet::new(e.clone());
        let mut remaining = Vec::with_capacity(factors.len());
        for factor in factors {
            if current.intersects(&factor) {
                current.merge(&factor);
            } else {
                remaining.push(factor);
            }
        }
        remaining.push(current);
        factors = remaining;
    }
    factors
}

/// Copies one factor's answer into the composed per-array byte maps. A
/// factor owning the whole array replaces every byte; otherwise only the
/// byte indices the factor actually constrains are taken.
fn merge_answer(
    composed: &mut HashMap<u64, (ArrayRef, Vec<u8>)>,
    factor: &IndependentSet,
    answer: &Assignment,
    arrays: &[ArrayRef],
) {
    for array in arrays {
        let Some(bytes) = answer.bytes_for(array) else {
            continue;
        };
        match composed.entry(array.id()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((array.clone(), bytes.to_vec()));
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let merged = &mut slot.get_mut().1;
                if factor.contains_whole(array) {
                    merged.copy_from_slice(bytes);
                } else if let Some(indices) = factor.element_indices(array) {
                    for &i in indices {
                        if (i as usize) < merged.len() {
                            merged[i as usize] = bytes[i as usize];
                        }
                    }
                }
            }
        }
    }
}

impl SolverImpl for IndependentSolver {
    fn name(&self) -> &'static str {
        "independent"
    }

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let relevant = self.relevant(query);
        let reduced = Query::new(&relevant, query.expr.clone());
        self.inner.compute_truth(&reduced)
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        let relevant = self.relevant(query);
        let reduced = Query::new(&relevant, query.expr.clone());
        self.inner.compute_validity(&reduced)
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec> {
        let relevant = self.relevant(query);
        let reduced = Query::new(&relevant, query.expr.clone());
        self.inner.compute_value(&reduced)
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        if !query.expr.is_false() {
            // Witness queries against a proposition keep their full set.
            return self.inner.compute_initial_values(query, arrays);
        }
        let owned;
        let factors: &[IndependentSet] = match query.factors {
            Some(f) => f,
            None => {
                owned = partition(query.constraints);
                &owned
            }
        };
        let mut composed: HashMap<u64, (ArrayRef, Vec<u8>)> = HashMap::new();
        match self.mode {
            IndependentMode::PerFactor => {
                for factor in factors {
                    let factor_arrays: Vec<ArrayRef> = factor
                        .arrays()
                        .into_iter()
                        .filter(|a| a.is_symbolic())
                        .collect();
                    if factor_arrays.is_empty() {
                        continue;
                    }
                    match self.solve_factor_group(&factor.exprs, &factor_arrays)? {
                        None => return Ok(None),
                        Some(answer) => {
                            merge_answer(&mut composed, factor, &answer, &factor_arrays)
                        }
                    }
                }
            }
            IndependentMode::Batch => {
                // Small factors amortize one solver call; each batch closes
                // once its cumulative expression count reaches the
                // threshold.
                let sorted: Vec<&IndependentSet> = factors
                    .iter()
                    .sorted_by_key(|f| f.exprs.len())
                    .collect();
                let mut batches: Vec<Vec<&IndependentSet>> = vec![Vec::new()];
                let mut acc = 0usize;
                for factor in sorted {
                    if acc >= self.batch_threshold && !batches.last().unwrap().is_empty() {
                        batches.push(Vec::new());
                        acc = 0;
                    }
                    batches.last_mut().unwrap().push(factor);
                    acc += factor.exprs.len();
                }
                for batch in batches.iter().filter(|b| !b.is_empty()) {
                    let exprs: Vec<ExprRef> = batch
                        .iter()
                        .flat_map(|f| f.exprs.iter().cloned())
                        .collect();
                    let batch_arrays: Vec<ArrayRef> = batch
                        .iter()
                        .flat_map(|f| f.arrays())
                        .filter(|a| a.is_symbolic())
                        .sorted_by_key(|a| a.id())
                        .dedup_by(|a, b| a.id() == b.id())
                        .collect();
                    if batch_arrays.is_empty() {
                        continue;
                    }
                    match self.solve_factor_group(&exprs, &batch_arrays)? {
                        None => return Ok(None),
                        Some(answer) => {
                            for factor in batch {
                                merge_answer(&mut composed, factor, &answer, &batch_arrays);
                            }
                        }
                    }
                }
            }
        }
        let mut assignment = Assignment::new(true);
        for (array, bytes) in composed.into_values() {
            assignment.bind(&array, bytes);
        }
        for array in arrays {
            if assignment.bytes_for(array).is_none() {
                assignment.bind(array, vec![0; array.size() as usize]);
            }
        }
        debug_assert_eq!(
            assignment.satisfies(query.constraints.iter()),
            Some(true),
            "composed assignment fails the original constraint set"
        );
        Ok(Some(assignment))
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::super::search::SearchSolver;
    use super::*;
    use crate::expr::{Expr, ExprContext, UpdateList, INT32};

    fn byte(a: &ArrayRef, i: u64) -> ExprRef {
        Expr::read(
            UpdateList::new(a.clone(), None),
            Expr::constant_u64(i, INT32),
        )
    }

    fn setup() -> (Vec<ExprRef>, ArrayRef, ArrayRef) {
        let a = ExprContext::with(|cx| cx.arrays.symbolic("is_a", 4));
        let b = ExprContext::with(|cx| cx.arrays.symbolic("is_b", 4));
        let constraints = vec![
            Expr::eq(Expr::constant_u64(7, 8), byte(&a, 0)),
            Expr::ult(byte(&a, 1), Expr::constant_u64(3, 8)),
            Expr::eq(Expr::constant_u64(9, 8), byte(&b, 2)),
        ];
        (constraints, a, b)
    }

    #[test]
    fn irrelevant_constraints_are_dropped() {
        let (constraints, a, _b) = setup();
        let mut solver =
            IndependentSolver::new(Box::new(SearchSolver::new(256)), IndependentMode::PerFactor, 8);
        let query = Query::new(&constraints, Expr::ult(byte(&a, 0), Expr::constant_u64(9, 8)));
        let relevant = solver.relevant(&query);
        assert_eq!(relevant.len(), 1);
        // The surviving constraint shares array bytes with the query.
        let closure = IndependentSet::footprint_of(&query.expr);
        assert!(closure.intersects(&IndependentSet::new(relevant[0].clone())));
        assert!(solver.compute_truth(&query).unwrap());
    }

    #[test]
    fn per_factor_answers_compose() {
        let (constraints, a, b) = setup();
        for mode in [IndependentMode::PerFactor, IndependentMode::Batch] {
            let mut solver =
                IndependentSolver::new(Box::new(SearchSolver::new(256)), mode, 2);
            let query = Query::new(&constraints, Expr::bool_const(false));
            let witness = solver
                .compute_initial_values(&query, &[a.clone(), b.clone()])
                .unwrap()
                .expect("satisfiable");
            assert_eq!(witness.satisfies(constraints.iter()), Some(true));
            assert_eq!(witness.bytes_for(&a).unwrap()[0], 7);
            assert!(witness.bytes_for(&a).unwrap()[1] < 3);
            assert_eq!(witness.bytes_for(&b).unwrap()[2], 9);
        }
    }
}
