//! The solver stack.
//!
//! A chain of wrappers behind one interface: counterexample cache, query
//! cache, independent-set decomposition, constant-array lowering, optional
//! cross-checking, and finally a back-end. The `Solver` facade owns the
//! chain and provides the query helpers the executor uses.

pub mod caching;
pub mod cex_cache;
pub mod const_arrays;
pub mod independent;
pub mod search;
pub mod smtlib;
pub mod validating;

use crate::constraints::{ConstraintManager, IndependentSet};
use crate::expr::{ArrayRef, Assignment, BitVec, Expr, ExprRef};
use crate::stats;
use log::debug;
use std::path::PathBuf;
use std::time::Duration;
use strum::{EnumString, VariantNames};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SolverError {
    #[error("failed to decide the query within the given limits")]
    Timeout,

    #[error("solver back-end failed: {0}")]
    Backend(String),

    #[error("cross-checked back-ends disagree: {0}")]
    Mismatch(String),
}

pub type SolverResult<T> = Result<T, SolverError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validity {
    True,
    False,
    Unknown,
}

/// A query against a constraint set. `expr` is the proposition whose
/// validity is asked; `factors` carries the manager's partition when the
/// caller has one, saving the independent layer a re-partition.
pub struct Query<'a> {
    pub constraints: &'a [ExprRef],
    pub factors: Option<&'a [IndependentSet]>,
    pub expr: ExprRef,
}

impl<'a> Query<'a> {
    pub fn new(constraints: &'a [ExprRef], expr: ExprRef) -> Self {
        Self {
            constraints,
            factors: None,
            expr,
        }
    }

    pub fn with_factors(
        constraints: &'a [ExprRef],
        factors: &'a [IndependentSet],
        expr: ExprRef,
    ) -> Self {
        Self {
            constraints,
            factors: Some(factors),
            expr,
        }
    }

    pub fn negated(&self) -> Query<'a> {
        Query {
            constraints: self.constraints,
            factors: self.factors,
            expr: Expr::logical_not(self.expr.clone()),
        }
    }
}

/// The four operations every layer of the chain implements.
///
/// `compute_truth` answers whether the constraints entail the expression;
/// `compute_initial_values` produces an assignment satisfying the
/// constraints together with the negation of the query expression (callers
/// pass `false` to ask for a witness of the constraints alone).
pub trait SolverImpl {
    fn name(&self) -> &'static str;

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool>;

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        if self.compute_truth(query)? {
            return Ok(Validity::True);
        }
        if self.compute_truth(&query.negated())? {
            return Ok(Validity::False);
        }
        Ok(Validity::Unknown)
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec>;

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>>;

    fn set_timeout(&mut self, timeout: Option<Duration>);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum BackendKind {
    Search,
    Smtlib,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum IndependentMode {
    PerFactor,
    Batch,
}

#[derive(Clone, Debug)]
pub struct SolverConfig {
    pub backend: BackendKind,
    pub smt_solver_path: PathBuf,
    pub timeout: Option<Duration>,
    pub use_cex_cache: bool,
    pub use_query_cache: bool,
    pub use_independent: bool,
    pub independent_mode: IndependentMode,
    /// Cumulative expression count per batched solver call.
    pub batch_threshold: usize,
    /// Largest constant array lowered into a select chain.
    pub const_array_threshold: u32,
    /// Iteration budget of the search back-end.
    pub search_budget: u64,
    /// Cross-check every answer against the search back-end.
    pub validate: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Search,
            smt_solver_path: PathBuf::from("z3"),
            timeout: Some(Duration::from_secs(30)),
            use_cex_cache: true,
            use_query_cache: true,
            use_independent: true,
            independent_mode: IndependentMode::PerFactor,
            batch_threshold: 64,
            const_array_threshold: 64,
            search_budget: 4096,
            validate: false,
        }
    }
}

/// Assembles the chain, outermost wrapper first.
pub fn build_chain(config: &SolverConfig) -> Solver {
    let backend: Box<dyn SolverImpl> = match config.backend {
        BackendKind::Search => Box::new(search::SearchSolver::new(config.search_budget)),
        BackendKind::Smtlib => Box::new(smtlib::SmtLibSolver::new(config.smt_solver_path.clone())),
    };
    let mut chain = backend;
    if config.validate {
        chain = Box::new(validating::ValidatingSolver::new(
            chain,
            Box::new(search::SearchSolver::new(config.search_budget)),
        ));
    }
    chain = Box::new(const_arrays::ConstArraySolver::new(
        chain,
        config.const_array_threshold,
    ));
    if config.use_independent {
        chain = Box::new(independent::IndependentSolver::new(
            chain,
            config.independent_mode,
            config.batch_threshold,
        ));
    }
    if config.use_query_cache {
        chain = Box::new(caching::CachingSolver::new(chain));
    }
    if config.use_cex_cache {
        chain = Box::new(cex_cache::CexCacheSolver::new(chain));
    }
    let mut solver = Solver::new(chain);
    solver.set_timeout(config.timeout);
    solver
}

/// The facade the executor talks to.
pub struct Solver {
    chain: Box<dyn SolverImpl>,
}

impl Solver {
    pub fn new(chain: Box<dyn SolverImpl>) -> Self {
        Self { chain }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.chain.set_timeout(timeout);
    }

    /// Validity of `expr` under the path condition.
    pub fn evaluate(&mut self, cm: &ConstraintManager, expr: &ExprRef) -> SolverResult<Validity> {
        if let Some(v) = expr.as_constant() {
            return Ok(if v.is_false() {
                Validity::False
            } else {
                Validity::True
            });
        }
        stats::SOLVER_QUERIES.inc();
        let query = Query::with_factors(cm.constraints(), cm.factors(), expr.clone());
        timed_query!(expr, { self.chain.compute_validity(&query) })
    }

    pub fn must_be_true(&mut self, cm: &ConstraintManager, expr: &ExprRef) -> SolverResult<bool> {
        if let Some(v) = expr.as_constant() {
            return Ok(v.is_true());
        }
        stats::SOLVER_QUERIES.inc();
        let query = Query::with_factors(cm.constraints(), cm.factors(), expr.clone());
        self.chain.compute_truth(&query)
    }

    pub fn must_be_false(&mut self, cm: &ConstraintManager, expr: &ExprRef) -> SolverResult<bool> {
        self.must_be_true(cm, &Expr::logical_not(expr.clone()))
    }

    pub fn may_be_true(&mut self, cm: &ConstraintManager, expr: &ExprRef) -> SolverResult<bool> {
        Ok(!self.must_be_false(cm, expr)?)
    }

    pub fn may_be_false(&mut self, cm: &ConstraintManager, expr: &ExprRef) -> SolverResult<bool> {
        Ok(!self.must_be_true(cm, expr)?)
    }

    /// Some feasible concrete value of `expr` under the path condition.
    pub fn get_value(&mut self, cm: &ConstraintManager, expr: &ExprRef) -> SolverResult<BitVec> {
        if let Some(v) = expr.as_constant() {
            return Ok(v);
        }
        stats::SOLVER_QUERIES.inc();
        let query = Query::with_factors(cm.constraints(), cm.factors(), expr.clone());
        self.chain.compute_value(&query)
    }

    /// A witness assignment for the requested arrays, or `None` when the
    /// path condition is unsatisfiable.
    pub fn get_initial_values(
        &mut self,
        cm: &ConstraintManager,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        stats::SOLVER_QUERIES.inc();
        let query = Query::with_factors(cm.constraints(), cm.factors(), Expr::bool_const(false));
        let result = self.chain.compute_initial_values(&query, arrays)?;
        if let Some(assignment) = &result {
            debug_assert_eq!(
                {
                    let mut checked = assignment.clone();
                    checked.default_zero = true;
                    checked.satisfies(cm.iter())
                },
                Some(true),
                "witness fails its own constraints"
            );
        }
        debug!(
            "initial values over {} arrays: {}",
            arrays.len(),
            if result.is_some() { "sat" } else { "unsat" }
        );
        Ok(result)
    }
}
