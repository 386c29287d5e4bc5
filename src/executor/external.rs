//! External-call servicing.
//!
//! The engine models a small set of library functions instead of calling
//! into the host. Arguments are concretized per the configured policy and
//! `errno` is propagated through the program's own global when it has one.

use super::{Executor, TerminationKind};
use crate::expr::{BitVec, Expr, ExprRef, INT32};
use crate::llir::ValueId;
use crate::solver::SolverError;
use crate::state::ExecutionState;
use log::{info, warn};
use strum::{EnumString, VariantNames};

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum ExternalPolicy {
    /// No external calls at all.
    None,
    /// Only calls whose arguments are already concrete.
    Concrete,
    /// Concretize symbolic arguments, pinning them with equalities.
    All,
}

impl<'p> Executor<'p> {
    pub(crate) fn call_external(
        &mut self,
        mut state: ExecutionState,
        name: &str,
        mut args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        match self.config.external_calls {
            ExternalPolicy::None => {
                self.terminate_on_error(
                    state,
                    TerminationKind::External,
                    format!("external calls are disallowed (calling {})", name),
                );
                return None;
            }
            ExternalPolicy::Concrete => {
                if args.iter().any(|a| !a.is_constant()) {
                    self.terminate_on_error(
                        state,
                        TerminationKind::External,
                        format!("symbolic argument passed to external function {}", name),
                    );
                    return None;
                }
            }
            ExternalPolicy::All => {
                for arg in &mut args {
                    if arg.is_constant() {
                        continue;
                    }
                    match self.concretize(&mut state, arg, "external call") {
                        Ok(v) => *arg = Expr::constant(v),
                        Err(SolverError::Timeout) => {
                            state.rewind_pc();
                            self.terminate_early(state, "query timed out (external call)");
                            return None;
                        }
                        Err(e) => {
                            self.terminate_on_solver_failure(state, e);
                            return None;
                        }
                    }
                }
            }
        }

        let result = match name {
            "puts" | "printf" => {
                if let Some(text) = args.first().and_then(|p| self.read_string(&state, p)) {
                    info!("[{}] {}: {}", state.id, name, text);
                }
                Some(BitVec::zero(INT32))
            }
            "putchar" => {
                let c = args
                    .first()
                    .and_then(|a| a.as_constant())
                    .map_or(0, |v| v.as_u64());
                info!("[{}] putchar: {}", state.id, (c as u8) as char);
                Some(BitVec::new(u128::from(c), INT32))
            }
            "abs" => {
                let v = args.first().and_then(|a| a.as_constant());
                match v {
                    Some(v) => {
                        let signed = BitVec::new(v.bits(), INT32).signed();
                        Some(BitVec::new(signed.unsigned_abs() as u128, INT32))
                    }
                    None => None,
                }
            }
            other => {
                warn!("[{}] unmodeled external function {}", state.id, other);
                self.terminate_on_error(
                    state,
                    TerminationKind::External,
                    format!("failed external call: {}", other),
                );
                return None;
            }
        };

        self.write_errno(&mut state, 0);
        if let (Some(dst), Some(value)) = (dst, result) {
            self.bind_dest(&mut state, dst, Expr::constant(value));
        }
        Some(state)
    }

    fn write_errno(&mut self, state: &mut ExecutionState, value: i32) {
        let Some(global) = self.program.global_named("errno") else {
            return;
        };
        let Some(object) = self.globals.get(&global).cloned() else {
            return;
        };
        if object.size < 4 {
            return;
        }
        if let Some(os) = state.address_space.get_writable(object.address) {
            os.write(0, Expr::constant_u64(value as u32 as u64, INT32), None);
        }
    }
}
