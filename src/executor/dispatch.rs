//! Instruction semantics: operand evaluation, arithmetic, control flow,
//! calls and the engine intrinsics.

use super::{pointer_constant, Executor, ForkOutcome, TerminationKind};
use crate::expr::{BitVec, Expr, ExprRef, PTR_WIDTH};
use crate::llir::{
    AluOp, BlockId, CastOp, CmpPred, CodePtr, FuncId, FunctionKind, Inst, Intrinsic, Operand,
    Program, ValueId,
};
use crate::expr::BinaryOp;
use crate::memory::ObjectState;
use crate::path::PathEntry;
use crate::solver::SolverError;
use crate::state::{ExecutionState, StackFrame};
use crate::stats;
use log::warn;
use rand::Rng;

/// Upper bound on distinct callees explored for one indirect call.
const MAX_CALL_RESOLUTIONS: usize = 16;

impl<'p> Executor<'p> {
    fn operand_expr(
        &self,
        state: &ExecutionState,
        operand: &Operand,
    ) -> Result<ExprRef, String> {
        match operand {
            Operand::Value(v) => state
                .local(*v)
                .cloned()
                .ok_or_else(|| format!("use of unbound SSA value %{}", v)),
            Operand::Const { bits, width } => Ok(Expr::constant(BitVec::new(*bits, *width))),
            Operand::Global(g) => {
                let object = self
                    .globals
                    .get(g)
                    .ok_or_else(|| format!("unknown global @{}", g))?;
                Ok(pointer_constant(object.address))
            }
            Operand::Function(id) => Ok(pointer_constant(Program::function_address(*id))),
            Operand::BlockAddress(b) => Ok(pointer_constant(Program::block_address(
                state.pc().func,
                *b,
            ))),
        }
    }

    fn operands(
        &self,
        state: &ExecutionState,
        operands: &[&Operand],
    ) -> Result<Vec<ExprRef>, String> {
        operands
            .iter()
            .map(|o| self.operand_expr(state, o))
            .collect()
    }

    pub(crate) fn execute_inst(
        &mut self,
        state: ExecutionState,
        inst: &Inst,
    ) -> Option<ExecutionState> {
        match self.execute_inst_inner(state, inst) {
            Ok(result) => result,
            Err((state, message)) => {
                self.terminate_on_error(state, TerminationKind::Exec, message);
                None
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn execute_inst_inner(
        &mut self,
        mut state: ExecutionState,
        inst: &Inst,
    ) -> Result<Option<ExecutionState>, (ExecutionState, String)> {
        macro_rules! eval {
            ($op:expr) => {
                match self.operand_expr(&state, $op) {
                    Ok(e) => e,
                    Err(msg) => return Err((state, msg)),
                }
            };
        }
        match inst {
            Inst::Alu { dst, op, lhs, rhs } => {
                let l = eval!(lhs);
                let r = eval!(rhs);
                if l.width() != r.width() {
                    return Err((state, "operand width mismatch".into()));
                }
                let result = Expr::binary(alu_to_binary(*op), l, r);
                self.bind_dest(&mut state, *dst, result);
                Ok(Some(state))
            }
            Inst::Cmp {
                dst,
                pred,
                lhs,
                rhs,
            } => {
                let l = eval!(lhs);
                let r = eval!(rhs);
                if l.width() != r.width() {
                    return Err((state, "operand width mismatch".into()));
                }
                let result = match pred {
                    CmpPred::Eq => Expr::eq(l, r),
                    CmpPred::Ne => Expr::ne(l, r),
                    CmpPred::Ult => Expr::ult(l, r),
                    CmpPred::Ule => Expr::ule(l, r),
                    CmpPred::Ugt => Expr::ugt(l, r),
                    CmpPred::Uge => Expr::uge(l, r),
                    CmpPred::Slt => Expr::slt(l, r),
                    CmpPred::Sle => Expr::sle(l, r),
                    CmpPred::Sgt => Expr::sgt(l, r),
                    CmpPred::Sge => Expr::sge(l, r),
                };
                self.bind_dest(&mut state, *dst, result);
                Ok(Some(state))
            }
            Inst::Not { dst, src } => {
                let e = eval!(src);
                let result = if e.is_bool() {
                    Expr::logical_not(e)
                } else {
                    Expr::not(e)
                };
                self.bind_dest(&mut state, *dst, result);
                Ok(Some(state))
            }
            Inst::Select {
                dst,
                cond,
                on_true,
                on_false,
            } => {
                let c = eval!(cond);
                if !c.is_bool() {
                    return Err((state, "select condition must be one bit wide".into()));
                }
                let t = eval!(on_true);
                let f = eval!(on_false);
                let result = Expr::select(c, t, f);
                self.bind_dest(&mut state, *dst, result);
                Ok(Some(state))
            }
            Inst::Cast {
                dst,
                op,
                src,
                width,
            } => {
                let e = eval!(src);
                let result = match op {
                    CastOp::Trunc => Expr::extract(e, 0, *width),
                    CastOp::ZExt => Expr::zext(e, *width),
                    CastOp::SExt => Expr::sext(e, *width),
                };
                self.bind_dest(&mut state, *dst, result);
                Ok(Some(state))
            }
            Inst::Phi { dst, incoming } => {
                let Some(pred) = state.thread().incoming_block else {
                    return Err((state, "phi executed without a predecessor block".into()));
                };
                let Some((_, operand)) = incoming.iter().find(|(b, _)| *b == pred) else {
                    return Err((
                        state,
                        format!("phi has no incoming value for block {}", pred),
                    ));
                };
                let value = eval!(&operand.clone());
                self.bind_dest(&mut state, *dst, value);
                Ok(Some(state))
            }
            Inst::Alloca { dst, size, align } => {
                let size = eval!(size);
                Ok(self.execute_alloc(state, size, true, Some(*dst), u64::from(*align), "alloca"))
            }
            Inst::Load { dst, addr, width } => {
                let address = eval!(addr);
                if address.width() != PTR_WIDTH {
                    return Err((state, "load address must be pointer wide".into()));
                }
                Ok(self.execute_memory_operation(state, false, address, None, Some(*dst), *width))
            }
            Inst::Store { addr, value } => {
                let address = eval!(addr);
                let value = eval!(value);
                if address.width() != PTR_WIDTH {
                    return Err((state, "store address must be pointer wide".into()));
                }
                Ok(self.execute_memory_operation(state, true, address, Some(value), None, 0))
            }
            Inst::Br { target } => {
                self.jump(&mut state, *target);
                Ok(Some(state))
            }
            Inst::CondBr {
                cond,
                on_true,
                on_false,
            } => {
                let c = eval!(cond);
                if !c.is_bool() {
                    return Err((state, "branch condition must be one bit wide".into()));
                }
                match self.fork(state, c, false) {
                    ForkOutcome::True(mut s) => {
                        self.jump(&mut s, *on_true);
                        Ok(Some(s))
                    }
                    ForkOutcome::False(mut s) => {
                        self.jump(&mut s, *on_false);
                        Ok(Some(s))
                    }
                    ForkOutcome::Both {
                        on_true: mut taken,
                        on_false: mut other,
                    } => {
                        self.jump(&mut taken, *on_true);
                        self.jump(&mut other, *on_false);
                        self.stage_state(other);
                        Ok(Some(taken))
                    }
                    ForkOutcome::Terminated => Ok(None),
                }
            }
            Inst::Switch {
                cond,
                default,
                cases,
            } => {
                let c = eval!(cond);
                Ok(self.execute_switch(state, c, *default, cases))
            }
            Inst::IndirectBr { addr, targets } => {
                let address = eval!(addr);
                Ok(self.execute_indirectbr(state, address, targets))
            }
            Inst::Call { dst, callee, args } => {
                let arg_exprs = match self.operands(&state, &args.iter().collect::<Vec<_>>()) {
                    Ok(v) => v,
                    Err(msg) => return Err((state, msg)),
                };
                match callee {
                    Operand::Function(id) => {
                        Ok(self.dispatch_call(state, *id, arg_exprs, *dst))
                    }
                    other => {
                        let callee_expr = eval!(other);
                        Ok(self.execute_indirect_call(state, callee_expr, arg_exprs, *dst))
                    }
                }
            }
            Inst::Ret { value } => {
                let value = match value {
                    Some(v) => Some(eval!(v)),
                    None => None,
                };
                Ok(self.execute_ret(state, value))
            }
            Inst::Unreachable => Err((state, "reached an unreachable instruction".into())),
        }
    }

    // ------------------------------------------------------------------
    // Switch

    fn execute_switch(
        &mut self,
        mut state: ExecutionState,
        cond: ExprRef,
        default: BlockId,
        cases: &[(u128, BlockId)],
    ) -> Option<ExecutionState> {
        if let Some(v) = cond.as_constant() {
            // Successor index 0 is the default, case i maps to i + 1.
            let (succ, target) = cases
                .iter()
                .position(|(value, _)| BitVec::new(*value, v.width()) == v)
                .map(|i| ((i + 1) as u16, cases[i].1))
                .unwrap_or((0, default));
            state.path.record(PathEntry::SwitchCase { case: succ });
            if let Some(cursor) = state.replay.as_mut() {
                match cursor.next() {
                    Some(PathEntry::SwitchCase { case }) if case == succ => {}
                    entry => {
                        self.terminate_on_error(
                            state,
                            TerminationKind::ReplayPath,
                            format!("switch took case {}, recorded {:?}", succ, entry),
                        );
                        return None;
                    }
                }
            }
            self.jump(&mut state, target);
            return Some(state);
        }

        // Group the case equations by successor block; the default block is
        // target 0 and carries the conjunction of all disequalities.
        let mut targets: Vec<BlockId> = vec![default];
        let mut conditions: Vec<ExprRef> = Vec::new();
        let mut default_cond = Expr::bool_const(true);
        for (value, _) in cases {
            let ne = Expr::ne(
                Expr::constant(BitVec::new(*value, cond.width())),
                cond.clone(),
            );
            default_cond = Expr::and(default_cond, ne);
        }
        conditions.push(default_cond);
        for (value, block) in cases {
            let eq = Expr::eq(
                Expr::constant(BitVec::new(*value, cond.width())),
                cond.clone(),
            );
            match targets.iter().position(|b| b == block) {
                Some(pos) => {
                    conditions[pos] = Expr::or(conditions[pos].clone(), eq);
                }
                None => {
                    targets.push(*block);
                    conditions.push(eq);
                }
            }
        }

        if state.replay.is_some() {
            let entry = state.replay.as_mut().unwrap().next();
            match entry {
                Some(PathEntry::SwitchBlock { block }) if (block as usize) < targets.len() => {
                    let index = block as usize;
                    state.path.record(PathEntry::SwitchBlock { block });
                    if !state.constraints.add(conditions[index].clone()) {
                        self.terminate_on_error(
                            state,
                            TerminationKind::ReplayPath,
                            "recorded switch target is infeasible".into(),
                        );
                        return None;
                    }
                    let target = targets[index];
                    self.jump(&mut state, target);
                    return Some(state);
                }
                Some(PathEntry::SwitchCase { case }) if (case as usize) <= cases.len() => {
                    // Recorded while the condition was concrete; narrow to
                    // that case's equation.
                    let (cond_expr, target) = if case == 0 {
                        (conditions[0].clone(), default)
                    } else {
                        let (value, block) = cases[(case - 1) as usize];
                        (
                            Expr::eq(
                                Expr::constant(BitVec::new(value, cond.width())),
                                cond.clone(),
                            ),
                            block,
                        )
                    };
                    state.path.record(PathEntry::SwitchCase { case });
                    if !state.constraints.add(cond_expr) {
                        self.terminate_on_error(
                            state,
                            TerminationKind::ReplayPath,
                            "recorded switch case is infeasible".into(),
                        );
                        return None;
                    }
                    self.jump(&mut state, target);
                    return Some(state);
                }
                entry => {
                    self.terminate_on_error(
                        state,
                        TerminationKind::ReplayPath,
                        format!("symbolic switch expected a switch entry, got {:?}", entry),
                    );
                    return None;
                }
            }
        }

        // Feasibility per successor block.
        let mut feasible: Vec<usize> = Vec::new();
        for (index, condition) in conditions.iter().enumerate() {
            match self.solver.may_be_true(&state.constraints, condition) {
                Ok(true) => feasible.push(index),
                Ok(false) => {}
                Err(SolverError::Timeout) => {
                    warn!("switch feasibility query timed out, skipping target");
                }
                Err(e) => {
                    self.terminate_on_solver_failure(state, e);
                    return None;
                }
            }
        }
        if feasible.is_empty() {
            self.terminate_early(state, "switch with no feasible successor");
            return None;
        }
        if feasible.len() > 1 && self.fork_inhibited(&state) {
            let pick = feasible[self.rng.gen_range(0..feasible.len())];
            feasible = vec![pick];
            warn!("skipping switch fork (inhibited)");
        }
        stats::FORKS.add(feasible.len() as u64 - 1);

        // The original state takes the first feasible target; the others
        // continue in forked copies.
        let mut slots = Vec::with_capacity(feasible.len());
        for _ in 1..feasible.len() {
            let id = self.fresh_state_id();
            slots.push(state.branch(id));
        }
        slots.insert(0, state);

        let mut survivor: Option<ExecutionState> = None;
        for (slot, &index) in slots.into_iter().zip(feasible.iter()) {
            let mut child = slot;
            child.path.record(PathEntry::SwitchBlock {
                block: index as u16,
            });
            if !child.constraints.add(conditions[index].clone()) {
                self.terminate_early(child, "switch target became infeasible");
                continue;
            }
            let target = targets[index];
            self.jump(&mut child, target);
            if survivor.is_none() {
                survivor = Some(child);
            } else {
                self.stage_state(child);
            }
        }
        survivor
    }

    // ------------------------------------------------------------------
    // Indirect branches

    fn execute_indirectbr(
        &mut self,
        mut state: ExecutionState,
        address: ExprRef,
        raw_targets: &[BlockId],
    ) -> Option<ExecutionState> {
        let mut targets: Vec<BlockId> = Vec::new();
        for t in raw_targets {
            if !targets.contains(t) {
                targets.push(*t);
            }
        }
        let func = state.pc().func;

        if let Some(v) = address.as_constant() {
            let resolved = self
                .program
                .block_by_address(v.as_u64())
                .filter(|(f, b)| *f == func && targets.contains(b));
            let Some((_, block)) = resolved else {
                self.terminate_on_error(
                    state,
                    TerminationKind::Exec,
                    "indirectbr: illegal label address".into(),
                );
                return None;
            };
            let index = targets.iter().position(|b| *b == block).unwrap() as u16;
            state.path.record(PathEntry::IndirectBr { target: index });
            if let Some(cursor) = state.replay.as_mut() {
                match cursor.next() {
                    Some(PathEntry::IndirectBr { target }) if target == index => {}
                    entry => {
                        self.terminate_on_error(
                            state,
                            TerminationKind::ReplayPath,
                            format!("indirectbr took {}, recorded {:?}", index, entry),
                        );
                        return None;
                    }
                }
            }
            self.jump(&mut state, block);
            return Some(state);
        }

        let conditions: Vec<ExprRef> = targets
            .iter()
            .map(|b| {
                Expr::eq(
                    pointer_constant(Program::block_address(func, *b)),
                    address.clone(),
                )
            })
            .collect();

        if state.replay.is_some() {
            let entry = state.replay.as_mut().unwrap().next();
            match entry {
                Some(PathEntry::IndirectBr { target }) if (target as usize) < targets.len() => {
                    let index = target as usize;
                    state.path.record(PathEntry::IndirectBr { target });
                    if !state.constraints.add(conditions[index].clone()) {
                        self.terminate_on_error(
                            state,
                            TerminationKind::ReplayPath,
                            "recorded indirectbr target is infeasible".into(),
                        );
                        return None;
                    }
                    let block = targets[index];
                    self.jump(&mut state, block);
                    return Some(state);
                }
                entry => {
                    self.terminate_on_error(
                        state,
                        TerminationKind::ReplayPath,
                        format!("indirectbr expected its entry, got {:?}", entry),
                    );
                    return None;
                }
            }
        }

        let mut feasible: Vec<usize> = Vec::new();
        for (index, condition) in conditions.iter().enumerate() {
            match self.solver.may_be_true(&state.constraints, condition) {
                Ok(true) => feasible.push(index),
                Ok(false) => {}
                Err(SolverError::Timeout) => {
                    warn!("indirectbr feasibility query timed out, skipping target");
                }
                Err(e) => {
                    self.terminate_on_solver_failure(state, e);
                    return None;
                }
            }
        }

        // An address outside the successor list is an error path of its
        // own.
        let mut outside = Expr::bool_const(true);
        for condition in &conditions {
            outside = Expr::and(outside, Expr::logical_not(condition.clone()));
        }
        let outside_feasible = self
            .solver
            .may_be_true(&state.constraints, &outside)
            .unwrap_or(false);

        if feasible.is_empty() && !outside_feasible {
            self.terminate_early(state, "indirectbr with no feasible successor");
            return None;
        }
        stats::FORKS
            .add((feasible.len() + usize::from(outside_feasible)).saturating_sub(1) as u64);

        // The original state takes the first feasible target; the illegal
        // remainder, when feasible, dies in a copy of its own.
        let mut copies = Vec::with_capacity(feasible.len());
        for _ in 1..feasible.len() + usize::from(outside_feasible) {
            let id = self.fresh_state_id();
            copies.push(state.branch(id));
        }
        copies.insert(0, state);
        let outside_state = if outside_feasible { copies.pop() } else { None };

        let mut survivor: Option<ExecutionState> = None;
        for (child, &index) in copies.into_iter().zip(feasible.iter()) {
            let mut child = child;
            child.path.record(PathEntry::IndirectBr {
                target: index as u16,
            });
            if !child.constraints.add(conditions[index].clone()) {
                self.terminate_early(child, "indirectbr target became infeasible");
                continue;
            }
            let block = targets[index];
            self.jump(&mut child, block);
            if survivor.is_none() {
                survivor = Some(child);
            } else {
                self.stage_state(child);
            }
        }
        if let Some(mut child) = outside_state {
            if child.constraints.add(outside) {
                self.terminate_on_error(
                    child,
                    TerminationKind::Exec,
                    "indirectbr: illegal label address".into(),
                );
            } else {
                self.terminate_early(child, "indirectbr outside-case became infeasible");
            }
        }
        survivor
    }

    // ------------------------------------------------------------------
    // Calls

    fn execute_indirect_call(
        &mut self,
        state: ExecutionState,
        callee: ExprRef,
        args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        if let Some(v) = callee.as_constant() {
            let Some(func) = self.program.function_by_address(v.as_u64()) else {
                self.terminate_on_error(
                    state,
                    TerminationKind::Exec,
                    format!("call to an invalid function pointer {:#x}", v.as_u64()),
                );
                return None;
            };
            return self.dispatch_call(state, func, args, dst);
        }

        let mut unbound = Some(state);
        for _ in 0..MAX_CALL_RESOLUTIONS {
            let current = unbound.take()?;
            let value = match self.solver.get_value(&current.constraints, &callee) {
                Ok(v) => v,
                Err(SolverError::Timeout) => {
                    self.terminate_early(current, "query timed out (indirect call)");
                    return None;
                }
                Err(e) => {
                    self.terminate_on_solver_failure(current, e);
                    return None;
                }
            };
            let matched = Expr::eq(Expr::constant(value), callee.clone());
            match self.fork(current, matched, true) {
                ForkOutcome::True(bound) => {
                    return self.finish_resolved_call(bound, value.as_u64(), args, dst);
                }
                ForkOutcome::Both {
                    on_true: bound,
                    on_false: rest,
                } => {
                    if let Some(serviced) =
                        self.finish_resolved_call(bound, value.as_u64(), args.clone(), dst)
                    {
                        self.stage_state(serviced);
                    }
                    unbound = Some(rest);
                }
                ForkOutcome::False(rest) => {
                    unbound = Some(rest);
                }
                ForkOutcome::Terminated => return None,
            }
        }
        if let Some(rest) = unbound {
            self.terminate_on_error(
                rest,
                TerminationKind::Exec,
                "too many resolutions for an indirect call".into(),
            );
        }
        None
    }

    fn finish_resolved_call(
        &mut self,
        state: ExecutionState,
        address: u64,
        args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        match self.program.function_by_address(address) {
            Some(func) => self.dispatch_call(state, func, args, dst),
            None => {
                self.terminate_on_error(
                    state,
                    TerminationKind::Exec,
                    format!("call to an invalid function pointer {:#x}", address),
                );
                None
            }
        }
    }

    pub(crate) fn dispatch_call(
        &mut self,
        state: ExecutionState,
        func: FuncId,
        args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        let function = self.program.function(func);
        match &function.kind {
            FunctionKind::Defined => self.push_call_frame(state, func, args, dst),
            FunctionKind::Intrinsic(which) => self.execute_intrinsic(state, *which, args, dst),
            FunctionKind::External => {
                let name = function.name.clone();
                self.call_external(state, &name, args, dst)
            }
        }
    }

    fn push_call_frame(
        &mut self,
        mut state: ExecutionState,
        func: FuncId,
        args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        let function = self.program.function(func);
        if state.stack_depth() >= self.config.max_stack_frames {
            self.terminate_early(state, "max stack frames exceeded");
            return None;
        }
        if args.len() < function.params.len() {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                format!("call to {} with too few arguments", function.name),
            );
            return None;
        }
        let return_site = state.pc();
        let mut frame = StackFrame::new(func, function, Some((return_site, dst)));
        for (index, width) in function.params.iter().enumerate() {
            let arg = adapt_width(args[index].clone(), *width);
            frame.locals[index] = Some(arg);
        }

        // Variadic callees get an on-stack area of eightbyte slots.
        if function.vararg && args.len() > function.params.len() {
            let extra = &args[function.params.len()..];
            let mut offsets = Vec::with_capacity(extra.len());
            let mut size = 0u64;
            for arg in extra {
                let bytes = u64::from((arg.width() + 7) / 8);
                offsets.push(size);
                size += bytes.max(8).next_multiple_of(8);
            }
            let object = self
                .memory
                .allocate(size, true, false, "varargs", 16, Some(return_site.tag()));
            let mut os = ObjectState::zeroed(object.clone());
            for (arg, offset) in extra.iter().zip(offsets) {
                os.write(offset, arg.clone(), Some(return_site.tag()));
            }
            state.address_space.bind(object.clone(), os);
            frame.varargs = Some(object.clone());
            frame.allocas.push(object);
        }

        let thread = state.thread_mut();
        thread.stack.push(frame);
        thread.pc = CodePtr::entry(func);
        thread.incoming_block = None;
        Some(state)
    }

    fn execute_ret(
        &mut self,
        mut state: ExecutionState,
        value: Option<ExprRef>,
    ) -> Option<ExecutionState> {
        let frame = state
            .thread_mut()
            .stack
            .pop()
            .expect("return with an empty stack");
        for object in &frame.allocas {
            state.address_space.unbind(object);
        }
        match frame.caller {
            Some((return_site, dst)) => {
                let thread = state.thread_mut();
                thread.pc = return_site;
                if let (Some(dst), Some(value)) = (dst, value) {
                    self.bind_dest(&mut state, dst, value);
                }
                Some(state)
            }
            None => {
                // The thread's root function returned.
                if state.thread_count() == 1 {
                    let code = match value {
                        None => 0,
                        Some(v) => match v.as_constant() {
                            Some(c) => c.as_u64(),
                            None => match self.concretize(&mut state, &v, "exit code") {
                                Ok(c) => c.as_u64(),
                                Err(_) => 0,
                            },
                        },
                    };
                    self.terminate_on_exit(state, code);
                    None
                } else {
                    self.exit_current_thread(state)
                }
            }
        }
    }

    fn exit_current_thread(&mut self, mut state: ExecutionState) -> Option<ExecutionState> {
        if state.thread_count() == 1 {
            self.terminate_on_exit(state, 0);
            return None;
        }
        let retired = state.current_thread_id();
        state.disable_current_thread();
        let mut state = self.schedule(state)?;
        let next = state.current_thread_id();
        state.retire_thread(retired, next);
        Some(state)
    }

    // ------------------------------------------------------------------
    // Intrinsics

    fn execute_intrinsic(
        &mut self,
        mut state: ExecutionState,
        which: Intrinsic,
        args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        match which {
            Intrinsic::Abort => {
                self.terminate_on_error(state, TerminationKind::Abort, "abort".into());
                None
            }
            Intrinsic::AssertFail => {
                let message = args
                    .first()
                    .and_then(|p| self.read_string(&state, p))
                    .unwrap_or_else(|| "assertion failed".into());
                self.terminate_on_error(state, TerminationKind::Assert, message);
                None
            }
            Intrinsic::ReportError => {
                let message = args
                    .first()
                    .and_then(|p| self.read_string(&state, p))
                    .unwrap_or_else(|| "reported error".into());
                self.terminate_on_error(state, TerminationKind::ReportError, message);
                None
            }
            Intrinsic::Exit => {
                let code = args
                    .first()
                    .and_then(|e| e.as_constant())
                    .map_or(0, |v| v.as_u64());
                self.terminate_on_exit(state, code);
                None
            }
            Intrinsic::Assume => {
                let Some(cond) = args.first().cloned() else {
                    self.terminate_on_error(
                        state,
                        TerminationKind::User,
                        "assume without a condition".into(),
                    );
                    return None;
                };
                let truth = if cond.is_bool() {
                    cond
                } else {
                    Expr::logical_not(Expr::is_zero(cond))
                };
                match self.solver.must_be_false(&state.constraints, &truth) {
                    Ok(true) => {
                        self.terminate_on_error(
                            state,
                            TerminationKind::User,
                            "invalid assumption (provably false)".into(),
                        );
                        None
                    }
                    Ok(false) | Err(SolverError::Timeout) => {
                        if !state.constraints.add(truth) {
                            self.terminate_on_error(
                                state,
                                TerminationKind::User,
                                "assumption made the path infeasible".into(),
                            );
                            return None;
                        }
                        Some(state)
                    }
                    Err(e) => {
                        self.terminate_on_solver_failure(state, e);
                        None
                    }
                }
            }
            Intrinsic::MakeSymbolic => self.execute_make_symbolic(state, args),
            Intrinsic::Malloc => {
                let Some(size) = args.first().cloned() else {
                    self.terminate_on_error(
                        state,
                        TerminationKind::User,
                        "malloc without a size".into(),
                    );
                    return None;
                };
                self.execute_alloc(state, size, false, dst, 16, "malloc")
            }
            Intrinsic::Calloc => {
                if args.len() < 2 {
                    self.terminate_on_error(
                        state,
                        TerminationKind::User,
                        "calloc needs a count and a size".into(),
                    );
                    return None;
                }
                let total = Expr::mul(args[0].clone(), args[1].clone());
                self.execute_alloc(state, total, false, dst, 16, "calloc")
            }
            Intrinsic::Free => {
                let Some(address) = args.first().cloned() else {
                    self.terminate_on_error(
                        state,
                        TerminationKind::User,
                        "free without a pointer".into(),
                    );
                    return None;
                };
                self.execute_free(state, address)
            }
            Intrinsic::ThreadCreate => self.execute_thread_create(state, args),
            Intrinsic::ThreadYield => self.schedule(state),
            Intrinsic::ThreadExit => self.exit_current_thread(state),
            Intrinsic::RecordValue => self.execute_record_value(state, args, dst),
            Intrinsic::CheckedAdd | Intrinsic::CheckedSub | Intrinsic::CheckedMul => {
                self.execute_checked_arith(state, which, args, dst)
            }
            Intrinsic::FAbs => {
                let Some(x) = args.first().cloned() else {
                    self.terminate_on_error(
                        state,
                        TerminationKind::User,
                        "fabs without an argument".into(),
                    );
                    return None;
                };
                let width = x.width();
                let mask = BitVec::ones(width).lshr(BitVec::new(1, width));
                let result = Expr::and(x, Expr::constant(mask));
                if let Some(dst) = dst {
                    self.bind_dest(&mut state, dst, result);
                }
                Some(state)
            }
            Intrinsic::VaStart => {
                let Some(pointer) = args.first().cloned() else {
                    self.terminate_on_error(
                        state,
                        TerminationKind::User,
                        "va_start without a pointer".into(),
                    );
                    return None;
                };
                let base = state
                    .frame()
                    .varargs
                    .as_ref()
                    .map_or(0, |object| object.address);
                self.execute_memory_operation(
                    state,
                    true,
                    pointer,
                    Some(pointer_constant(base)),
                    None,
                    0,
                )
            }
            Intrinsic::VaEnd => Some(state),
        }
    }

    fn execute_make_symbolic(
        &mut self,
        mut state: ExecutionState,
        args: Vec<ExprRef>,
    ) -> Option<ExecutionState> {
        let (Some(pointer), Some(size)) = (args.first(), args.get(1)) else {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "make_symbolic needs a pointer and a size".into(),
            );
            return None;
        };
        let (Some(pointer), Some(size)) = (pointer.as_constant(), size.as_constant()) else {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "make_symbolic needs concrete arguments".into(),
            );
            return None;
        };
        let name = args
            .get(2)
            .and_then(|p| self.read_string(&state, p))
            .unwrap_or_else(|| "unnamed".into());
        let Some(binding) = state.address_space.find(pointer.as_u64()) else {
            self.terminate_on_error(
                state,
                TerminationKind::Ptr,
                "make_symbolic of an unmapped address".into(),
            );
            return None;
        };
        let object = binding.object.clone();
        if object.address != pointer.as_u64() || object.size != size.as_u64() {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                format!(
                    "wrong size given to make_symbolic (object is {} bytes)",
                    object.size
                ),
            );
            return None;
        }
        let unique = state.unique_array_name(&name);
        let array =
            crate::expr::ExprContext::with(|cx| cx.arrays.symbolic(&unique, object.size as u32));
        state
            .address_space
            .bind(object.clone(), ObjectState::from_array(object.clone(), array.clone()));
        state.symbolics.push((object, array));
        Some(state)
    }

    fn execute_thread_create(
        &mut self,
        mut state: ExecutionState,
        args: Vec<ExprRef>,
    ) -> Option<ExecutionState> {
        let (Some(entry), arg) = (args.first(), args.get(1).cloned()) else {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "thread_create needs a function pointer".into(),
            );
            return None;
        };
        let Some(address) = entry.as_constant() else {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "thread_create cannot take a symbolic function pointer".into(),
            );
            return None;
        };
        let Some(func) = self.program.function_by_address(address.as_u64()) else {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "thread_create cannot locate the start function".into(),
            );
            return None;
        };
        let function = self.program.function(func);
        let thread = state.spawn_thread(func, function);
        if let Some(arg) = arg {
            if !function.params.is_empty() {
                let adapted = adapt_width(arg, function.params[0]);
                state.thread_by_id_mut(thread).stack[0].locals[0] = Some(adapted);
            }
        }
        // Creation is a scheduling point.
        self.schedule(state)
    }

    fn execute_record_value(
        &mut self,
        mut state: ExecutionState,
        args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        let Some(value) = args.first().cloned() else {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "record_value without a value".into(),
            );
            return None;
        };
        let id = state.prev_pc().tag().to_string();
        let width = value.width() as u16;

        let concrete = if state.replay.is_some() {
            let entry = state.replay.as_mut().unwrap().next();
            match entry {
                Some(PathEntry::DataRec {
                    id: recorded_id,
                    width: recorded_width,
                    bytes,
                }) if recorded_width == width => {
                    if recorded_id != id {
                        warn!(
                            "data record site mismatch: {} recorded, {} executing",
                            recorded_id, id
                        );
                    }
                    let mut bits: u128 = 0;
                    for (i, b) in bytes.iter().enumerate() {
                        bits |= u128::from(*b) << (8 * i);
                    }
                    let recorded = BitVec::new(bits, value.width());
                    if !state
                        .constraints
                        .add(Expr::eq(Expr::constant(recorded), value.clone()))
                    {
                        self.terminate_on_error(
                            state,
                            TerminationKind::ReplayPath,
                            "recorded data value is infeasible on this path".into(),
                        );
                        return None;
                    }
                    recorded
                }
                entry => {
                    self.terminate_on_error(
                        state,
                        TerminationKind::ReplayPath,
                        format!("expected a data record, got {:?}", entry),
                    );
                    return None;
                }
            }
        } else {
            match self.concretize(&mut state, &value, "record_value") {
                Ok(v) => v,
                Err(SolverError::Timeout) => {
                    state.rewind_pc();
                    self.terminate_early(state, "query timed out (record_value)");
                    return None;
                }
                Err(e) => {
                    self.terminate_on_solver_failure(state, e);
                    return None;
                }
            }
        };

        let byte_count = ((width + 7) / 8) as usize;
        let mut bytes = Vec::with_capacity(byte_count);
        for i in 0..byte_count {
            bytes.push((concrete.bits() >> (8 * i)) as u8);
        }
        state.path.record(PathEntry::DataRec { id, width, bytes });
        if let Some(dst) = dst {
            self.bind_dest(&mut state, dst, Expr::constant(concrete));
        }
        Some(state)
    }

    fn execute_checked_arith(
        &mut self,
        state: ExecutionState,
        which: Intrinsic,
        args: Vec<ExprRef>,
        dst: Option<ValueId>,
    ) -> Option<ExecutionState> {
        if args.len() < 2 || args[0].width() != args[1].width() {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "checked arithmetic needs two equally wide operands".into(),
            );
            return None;
        }
        let (a, b) = (args[0].clone(), args[1].clone());
        let width = a.width();
        let (result, overflow) = match which {
            Intrinsic::CheckedAdd => {
                let sum = Expr::add(a.clone(), b.clone());
                (sum.clone(), Expr::ult(sum, a))
            }
            Intrinsic::CheckedSub => (Expr::sub(a.clone(), b.clone()), Expr::ult(a, b)),
            Intrinsic::CheckedMul => {
                let wide = Expr::mul(
                    Expr::zext(a.clone(), width * 2),
                    Expr::zext(b.clone(), width * 2),
                );
                let high = Expr::extract(wide.clone(), width, width);
                (
                    Expr::extract(wide, 0, width),
                    Expr::logical_not(Expr::is_zero(high)),
                )
            }
            _ => unreachable!("not a checked intrinsic"),
        };
        match self.fork(state, overflow, true) {
            ForkOutcome::True(s) => {
                self.terminate_on_error(
                    s,
                    TerminationKind::Overflow,
                    "checked arithmetic overflowed".into(),
                );
                None
            }
            ForkOutcome::False(mut s) => {
                if let Some(dst) = dst {
                    self.bind_dest(&mut s, dst, result);
                }
                Some(s)
            }
            ForkOutcome::Both {
                on_true: overflowed,
                on_false: mut fine,
            } => {
                self.terminate_on_error(
                    overflowed,
                    TerminationKind::Overflow,
                    "checked arithmetic overflowed".into(),
                );
                if let Some(dst) = dst {
                    self.bind_dest(&mut fine, dst, result);
                }
                Some(fine)
            }
            ForkOutcome::Terminated => None,
        }
    }

    // ------------------------------------------------------------------
    // Allocation and free

    pub(crate) fn execute_alloc(
        &mut self,
        mut state: ExecutionState,
        size: ExprRef,
        is_local: bool,
        dst: Option<ValueId>,
        align: u64,
        name: &str,
    ) -> Option<ExecutionState> {
        if let Some(v) = size.as_constant() {
            return Some(self.bind_fresh_object(state, v.as_u64(), is_local, dst, align, name));
        }

        // Symbolic size: concretize towards small examples, fork off the
        // chosen size, and treat huge remainders as failing allocations.
        let mut example = match self.solver.get_value(&state.constraints, &size) {
            Ok(v) => v,
            Err(SolverError::Timeout) => {
                state.rewind_pc();
                self.terminate_early(state, "query timed out (alloc)");
                return None;
            }
            Err(e) => {
                self.terminate_on_solver_failure(state, e);
                return None;
            }
        };
        while example.bits() > 128 {
            let half = BitVec::new(example.bits() >> 1, example.width());
            let eq = Expr::eq(Expr::constant(half), size.clone());
            match self.solver.may_be_true(&state.constraints, &eq) {
                Ok(true) => example = half,
                _ => break,
            }
        }

        let chosen = Expr::eq(Expr::constant(example), size.clone());
        match self.fork(state, chosen, true) {
            ForkOutcome::True(s) => {
                Some(self.bind_fresh_object(s, example.as_u64(), is_local, dst, align, name))
            }
            ForkOutcome::Both {
                on_true: bound,
                on_false: rest,
            } => {
                let serviced =
                    self.bind_fresh_object(bound, example.as_u64(), is_local, dst, align, name);
                self.stage_state(serviced);

                let huge = Expr::ult(
                    Expr::constant_u64(1 << 31, size.width()),
                    size.clone(),
                );
                match self.fork(rest, huge, true) {
                    ForkOutcome::True(mut h) => {
                        // Huge allocations fail and return null.
                        if let Some(dst) = dst {
                            self.bind_dest(&mut h, dst, pointer_constant(0));
                        }
                        Some(h)
                    }
                    ForkOutcome::Both {
                        on_true: mut h,
                        on_false: other,
                    } => {
                        if let Some(dst) = dst {
                            self.bind_dest(&mut h, dst, pointer_constant(0));
                        }
                        self.stage_state(h);
                        self.terminate_on_error(
                            other,
                            TerminationKind::Model,
                            "concretized symbolic allocation size".into(),
                        );
                        None
                    }
                    ForkOutcome::False(other) => {
                        self.terminate_on_error(
                            other,
                            TerminationKind::Model,
                            "concretized symbolic allocation size".into(),
                        );
                        None
                    }
                    ForkOutcome::Terminated => None,
                }
            }
            ForkOutcome::False(s) => {
                // The sampled size was the only infeasible one; retry once
                // with a fresh sample next step.
                self.terminate_on_error(
                    s,
                    TerminationKind::Model,
                    "cannot concretize symbolic allocation size".into(),
                );
                None
            }
            ForkOutcome::Terminated => None,
        }
    }

    fn bind_fresh_object(
        &mut self,
        mut state: ExecutionState,
        size: u64,
        is_local: bool,
        dst: Option<ValueId>,
        align: u64,
        name: &str,
    ) -> ExecutionState {
        let site = state.prev_pc().tag();
        let object = self
            .memory
            .allocate(size, is_local, false, name, align, Some(site));
        state
            .address_space
            .bind(object.clone(), ObjectState::zeroed(object.clone()));
        if is_local {
            state.frame_mut().allocas.push(object.clone());
        }
        if let Some(dst) = dst {
            self.bind_dest(&mut state, dst, pointer_constant(object.address));
        }
        state
    }

    pub(crate) fn execute_free(
        &mut self,
        state: ExecutionState,
        address: ExprRef,
    ) -> Option<ExecutionState> {
        // NULL frees are no-ops.
        let is_null = Expr::is_zero(address.clone());
        let (null_side, nonnull_side) = match self.fork(state, is_null, true) {
            ForkOutcome::True(s) => (Some(s), None),
            ForkOutcome::False(s) => (None, Some(s)),
            ForkOutcome::Both {
                on_true,
                on_false,
            } => (Some(on_true), Some(on_false)),
            ForkOutcome::Terminated => return None,
        };
        let mut survivor = null_side;

        if let Some(current) = nonnull_side {
            // Resolve exactly: fork per candidate base address.
            let candidates: Vec<_> = current
                .address_space
                .iter()
                .map(|b| b.object.clone())
                .collect();
            let mut unbound = Some(current);
            for object in candidates {
                let Some(cur) = unbound.take() else { break };
                let here = Expr::eq(object.base_expr(), address.clone());
                let feasible = self
                    .solver
                    .may_be_true(&cur.constraints, &here)
                    .unwrap_or(true);
                if !feasible {
                    unbound = Some(cur);
                    continue;
                }
                match self.fork(cur, here, true) {
                    ForkOutcome::True(bound) => {
                        if let Some(freed) = self.free_bound(bound, &object, &address) {
                            if survivor.is_none() {
                                survivor = Some(freed);
                            } else {
                                self.stage_state(freed);
                            }
                        }
                        unbound = None;
                    }
                    ForkOutcome::Both {
                        on_true: bound,
                        on_false: rest,
                    } => {
                        if let Some(freed) = self.free_bound(bound, &object, &address) {
                            self.stage_state(freed);
                        }
                        unbound = Some(rest);
                    }
                    ForkOutcome::False(rest) => {
                        unbound = Some(rest);
                    }
                    ForkOutcome::Terminated => {
                        unbound = None;
                    }
                }
            }
            if let Some(rest) = unbound {
                let info = self.address_info(&rest, &address);
                self.terminate_on_error(
                    rest,
                    TerminationKind::Ptr,
                    format!("memory error: invalid pointer: free{}", info),
                );
            }
        }
        survivor
    }

    fn free_bound(
        &mut self,
        mut state: ExecutionState,
        object: &crate::memory::MemoryObjectRef,
        address: &ExprRef,
    ) -> Option<ExecutionState> {
        if object.is_local {
            let info = self.address_info(&state, address);
            self.terminate_on_error(
                state,
                TerminationKind::Free,
                format!("free of alloca{}", info),
            );
            return None;
        }
        if object.is_global {
            let info = self.address_info(&state, address);
            self.terminate_on_error(
                state,
                TerminationKind::Free,
                format!("free of global{}", info),
            );
            return None;
        }
        state.address_space.unbind(object);
        Some(state)
    }

    // ------------------------------------------------------------------
    // Strings

    /// Reads a concrete NUL-terminated string for error reports and
    /// make_symbolic names.
    pub(crate) fn read_string(&self, state: &ExecutionState, pointer: &ExprRef) -> Option<String> {
        let address = pointer.as_constant()?.as_u64();
        let binding = state.address_space.find(address)?;
        let offset = address - binding.object.address;
        let mut bytes = Vec::new();
        for i in offset..binding.object.size.min(offset + 1024) {
            let byte = binding.state.read8(i).as_constant()?;
            if byte.is_zero() {
                return String::from_utf8(bytes).ok();
            }
            bytes.push(byte.as_u64() as u8);
        }
        None
    }
}

fn alu_to_binary(op: AluOp) -> BinaryOp {
    match op {
        AluOp::Add => BinaryOp::Add,
        AluOp::Sub => BinaryOp::Sub,
        AluOp::Mul => BinaryOp::Mul,
        AluOp::UDiv => BinaryOp::UDiv,
        AluOp::SDiv => BinaryOp::SDiv,
        AluOp::URem => BinaryOp::URem,
        AluOp::SRem => BinaryOp::SRem,
        AluOp::And => BinaryOp::And,
        AluOp::Or => BinaryOp::Or,
        AluOp::Xor => BinaryOp::Xor,
        AluOp::Shl => BinaryOp::Shl,
        AluOp::LShr => BinaryOp::LShr,
        AluOp::AShr => BinaryOp::AShr,
    }
}

/// Zero-extends or truncates an argument to its parameter width.
fn adapt_width(expr: ExprRef, width: crate::expr::Width) -> ExprRef {
    use std::cmp::Ordering;
    match expr.width().cmp(&width) {
        Ordering::Equal => expr,
        Ordering::Less => Expr::zext(expr, width),
        Ordering::Greater => Expr::extract(expr, 0, width),
    }
}

