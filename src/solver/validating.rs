//! Cross-checks a primary back-end against a reference implementation.
//! A definite answer from both that disagrees is an engine-fatal mismatch;
//! a timeout on either side falls back to the other.

use super::{Query, SolverError, SolverImpl, SolverResult, Validity};
use crate::expr::{ArrayRef, Assignment, BitVec};
use std::time::Duration;

pub struct ValidatingSolver {
    primary: Box<dyn SolverImpl>,
    reference: Box<dyn SolverImpl>,
}

impl ValidatingSolver {
    pub fn new(primary: Box<dyn SolverImpl>, reference: Box<dyn SolverImpl>) -> Self {
        Self { primary, reference }
    }
}

impl SolverImpl for ValidatingSolver {
    fn name(&self) -> &'static str {
        "validating"
    }

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        match (
            self.primary.compute_truth(query),
            self.reference.compute_truth(query),
        ) {
            (Ok(a), Ok(b)) if a == b => Ok(a),
            (Ok(a), Ok(b)) => Err(SolverError::Mismatch(format!(
                "{} says {}, {} says {}",
                self.primary.name(),
                a,
                self.reference.name(),
                b
            ))),
            (Ok(a), Err(SolverError::Timeout)) => Ok(a),
            (Err(SolverError::Timeout), Ok(b)) => Ok(b),
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
        }
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        match (
            self.primary.compute_validity(query),
            self.reference.compute_validity(query),
        ) {
            (Ok(a), Ok(b)) if a == b => Ok(a),
            (Ok(a), Ok(b)) => Err(SolverError::Mismatch(format!(
                "{} says {:?}, {} says {:?}",
                self.primary.name(),
                a,
                self.reference.name(),
                b
            ))),
            (Ok(a), Err(SolverError::Timeout)) => Ok(a),
            (Err(SolverError::Timeout), Ok(b)) => Ok(b),
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
        }
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec> {
        self.primary.compute_value(query)
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        let result = self.primary.compute_initial_values(query, arrays)?;
        if let Some(assignment) = &result {
            let mut checked = assignment.clone();
            checked.default_zero = true;
            if checked.satisfies(query.constraints.iter()) != Some(true) {
                return Err(SolverError::Mismatch(format!(
                    "{} produced a witness violating its constraints",
                    self.primary.name()
                )));
            }
        }
        Ok(result)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.primary.set_timeout(timeout);
        self.reference.set_timeout(timeout);
    }
}
