//! Lowers reads of small constant arrays under a symbolic index into
//! select chains, sparing back-ends the array theory for promoted concrete
//! objects.

use super::{Query, SolverImpl, SolverResult, Validity};
use crate::expr::visitor::{Action, ExprRewriter, RewriteDriver, UpdateNodeCache};
use crate::expr::{ArrayRef, Assignment, BitVec, Expr, ExprKind, ExprRef};
use std::rc::Rc;
use std::time::Duration;

pub struct ConstArraySolver {
    inner: Box<dyn SolverImpl>,
    threshold: u32,
}

impl ConstArraySolver {
    pub fn new(inner: Box<dyn SolverImpl>, threshold: u32) -> Self {
        Self { inner, threshold }
    }

    fn lower_all(&self, exprs: &[ExprRef]) -> Option<Vec<ExprRef>> {
        let mut visitor = LowerConstReads {
            threshold: self.threshold,
        };
        let mut un_cache = UpdateNodeCache::default();
        let mut driver = RewriteDriver::new(&mut visitor, &mut un_cache);
        let lowered: Vec<ExprRef> = exprs.iter().map(|e| driver.rewrite(e)).collect();
        if lowered
            .iter()
            .zip(exprs.iter())
            .all(|(a, b)| Rc::ptr_eq(a, b))
        {
            None
        } else {
            Some(lowered)
        }
    }
}

struct LowerConstReads {
    threshold: u32,
}

impl ExprRewriter for LowerConstReads {
    fn visit(&mut self, e: &ExprRef) -> Action {
        let ExprKind::Read { updates, index } = e.kind() else {
            return Action::DoChildren;
        };
        let array = updates.root();
        if index.is_constant()
            || !array.is_constant()
            || !updates.is_empty()
            || array.size() > self.threshold
            || array.size() == 0
        {
            return Action::DoChildren;
        }
        // Out-of-range indices collapse onto the last element; reads are
        // bounds-checked before they are built.
        let values = array.constant_values();
        let mut chain = Expr::constant(values[values.len() - 1]);
        for i in (0..values.len() - 1).rev() {
            chain = Expr::select(
                Expr::eq(
                    Expr::constant_u64(i as u64, array.domain()),
                    index.clone(),
                ),
                Expr::constant(values[i]),
                chain,
            );
        }
        Action::ChangeTo(chain)
    }
}

impl SolverImpl for ConstArraySolver {
    fn name(&self) -> &'static str {
        "const-arrays"
    }

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let mut all: Vec<ExprRef> = query.constraints.to_vec();
        all.push(query.expr.clone());
        match self.lower_all(&all) {
            None => self.inner.compute_truth(query),
            Some(mut lowered) => {
                let expr = lowered.pop().unwrap();
                let reduced = Query::new(&lowered, expr);
                self.inner.compute_truth(&reduced)
            }
        }
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        let mut all: Vec<ExprRef> = query.constraints.to_vec();
        all.push(query.expr.clone());
        match self.lower_all(&all) {
            None => self.inner.compute_validity(query),
            Some(mut lowered) => {
                let expr = lowered.pop().unwrap();
                let reduced = Query::new(&lowered, expr);
                self.inner.compute_validity(&reduced)
            }
        }
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec> {
        let mut all: Vec<ExprRef> = query.constraints.to_vec();
        all.push(query.expr.clone());
        match self.lower_all(&all) {
            None => self.inner.compute_value(query),
            Some(mut lowered) => {
                let expr = lowered.pop().unwrap();
                let reduced = Query::new(&lowered, expr);
                self.inner.compute_value(&reduced)
            }
        }
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        match self.lower_all(query.constraints) {
            None => self.inner.compute_initial_values(query, arrays),
            Some(lowered) => {
                let reduced = Query::new(&lowered, query.expr.clone());
                self.inner.compute_initial_values(&reduced, arrays)
            }
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::super::search::SearchSolver;
    use super::*;
    use crate::expr::{ExprContext, UpdateList, INT32, INT8};

    #[test]
    fn constant_reads_lower_to_selects() {
        let table = ExprContext::with(|cx| cx.arrays.constant_bytes("ca_tab", &[5, 6, 7, 8]));
        let idx = ExprContext::with(|cx| cx.arrays.symbolic("ca_idx", 1));
        let i = Expr::zext(
            Expr::read(
                UpdateList::new(idx.clone(), None),
                Expr::constant_u64(0, INT32),
            ),
            INT32,
        );
        let lookup = Expr::read(UpdateList::new(table, None), i.clone());

        let mut solver = ConstArraySolver::new(Box::new(SearchSolver::new(256)), 16);
        // With i == 2 the lowered chain must force the lookup to 7.
        let constraints = vec![
            Expr::eq(Expr::constant_u64(2, INT32), i),
            Expr::eq(Expr::constant_u64(7, INT8), lookup.clone()),
        ];
        let q = Query::new(&constraints, Expr::bool_const(false));
        let witness = solver
            .compute_initial_values(&q, &[])
            .unwrap()
            .expect("satisfiable");
        assert_eq!(
            witness.evaluate(&lookup).map(|v| v.as_u64()),
            Some(7),
            "the witness index selects the matching table entry"
        );
    }
}
