//! The executor: instruction stepping, forking, the memory-operation
//! paths, cooperative scheduling, and record/replay.

pub mod dispatch;
pub mod external;
pub mod termination;

pub use external::ExternalPolicy;
pub use termination::{ExitReason, TerminationKind, TestCase};

use crate::constraints::{ConstraintConfig, ConstraintManager};
use crate::expr::{BitVec, Expr, ExprRef, InstTag, Width, PTR_WIDTH};
use crate::llir::{CodePtr, FuncId, GlobalId, Program};
use crate::memory::{MemoryManager, MemoryObjectRef, ObjectState};
use crate::path::PathEntry;
use crate::searcher::{new_searcher, Searcher, SearcherKind};
use crate::solver::{Solver, SolverConfig, SolverError, Validity};
use crate::state::{ExecutionState, StateId};
use crate::stats;
use bytesize::ByteSize;
use log::{debug, info, trace, warn};
use rand::prelude::*;
use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("program has no entry function")]
    NoEntry,

    #[error("fatal solver failure: {0}")]
    Solver(SolverError),

    #[error("cannot open trace sink: {0}")]
    TraceSink(std::io::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceSink {
    None,
    Stderr,
    File,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressInfoLevel {
    /// Report only the faulting address expression.
    None,
    /// Also include a concrete example and the nearest object ranges.
    Full,
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub max_time: Option<Duration>,
    /// Instruction budget; 0 disables.
    pub max_instructions: u64,
    /// Cap on lifetime forks.
    pub max_forks: u64,
    /// Cap on symbolic-branch depth per path; 0 disables.
    pub max_depth: u32,
    pub max_memory: Option<ByteSize>,
    /// Inhibit forking at the memory cap instead of killing states.
    pub max_memory_inhibit: bool,
    pub max_stack_frames: usize,
    /// Concretize symbolic indices into arrays at least this large;
    /// 0 disables.
    pub max_sym_array_size: u64,
    pub simplify_sym_indices: bool,
    pub equality_substitution: bool,
    pub rewrite_equalities: bool,
    pub check_out_of_bounds: bool,
    pub external_calls: ExternalPolicy,
    pub exit_on_error_kind: Option<TerminationKind>,
    pub trace: TraceSink,
    pub trace_file: Option<std::path::PathBuf>,
    pub searcher: SearcherKind,
    pub seed: u64,
    pub address_info: AddressInfoLevel,
    /// Fork-share-per-instruction budget; 1.0 disables.
    pub max_static_fork_pct: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_time: None,
            max_instructions: 0,
            max_forks: u64::MAX,
            max_depth: 0,
            max_memory: None,
            max_memory_inhibit: true,
            max_stack_frames: 8192,
            max_sym_array_size: 0,
            simplify_sym_indices: false,
            equality_substitution: true,
            rewrite_equalities: true,
            check_out_of_bounds: true,
            external_calls: ExternalPolicy::Concrete,
            exit_on_error_kind: None,
            trace: TraceSink::None,
            trace_file: None,
            searcher: SearcherKind::DepthFirst,
            seed: 0x5eed,
            address_info: AddressInfoLevel::None,
            max_static_fork_pct: 1.0,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub test_cases: Vec<TestCase>,
    pub halted: bool,
    pub instructions: u64,
}

/// Outcome of a two-way fork; states the caller does not receive were
/// terminated inside.
pub enum ForkOutcome {
    True(ExecutionState),
    False(ExecutionState),
    Both {
        on_true: ExecutionState,
        on_false: ExecutionState,
    },
    Terminated,
}

/// The process tree: one node per state lifetime, recording fork lineage.
#[derive(Default)]
pub struct ProcessTree {
    nodes: Vec<ProcessNode>,
}

pub struct ProcessNode {
    pub parent: Option<usize>,
    pub state: Option<StateId>,
}

impl ProcessTree {
    fn root(&mut self, state: StateId) -> usize {
        self.nodes.push(ProcessNode {
            parent: None,
            state: Some(state),
        });
        self.nodes.len() - 1
    }

    /// Splits `parent_node` into two children; the parent stops owning a
    /// state.
    fn attach(&mut self, parent_node: usize, left: StateId, right: StateId) -> (usize, usize) {
        self.nodes[parent_node].state = None;
        self.nodes.push(ProcessNode {
            parent: Some(parent_node),
            state: Some(left),
        });
        let l = self.nodes.len() - 1;
        self.nodes.push(ProcessNode {
            parent: Some(parent_node),
            state: Some(right),
        });
        (l, self.nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct Executor<'p> {
    pub(crate) program: &'p Program,
    pub(crate) config: ExecutorConfig,
    pub(crate) solver: Solver,
    pub(crate) memory: MemoryManager,
    states: HashMap<StateId, ExecutionState>,
    searcher: Box<dyn Searcher>,
    added: Vec<StateId>,
    removed: Vec<StateId>,
    next_state_id: StateId,
    test_cases: Vec<TestCase>,
    halt: bool,
    pub(crate) globals: HashMap<GlobalId, MemoryObjectRef>,
    ptree: ProcessTree,
    fork_counts: HashMap<InstTag, u64>,
    at_memory_limit: bool,
    trace_sink: Option<Box<dyn Write>>,
    pub(crate) rng: StdRng,
    instructions: u64,
    /// Id of the state the searcher selected for the running step. A state
    /// still carrying it must come back as the step's survivor, never as a
    /// staged addition.
    current_step_state: StateId,
    deferred_survivor: Option<ExecutionState>,
}

impl<'p> Executor<'p> {
    pub fn new(
        program: &'p Program,
        config: ExecutorConfig,
        solver_config: &SolverConfig,
    ) -> Result<Self, ExecutionError> {
        let solver = crate::solver::build_chain(solver_config);
        let searcher = new_searcher(config.searcher, config.seed);
        let trace_sink: Option<Box<dyn Write>> = match config.trace {
            TraceSink::None => None,
            TraceSink::Stderr => Some(Box::new(std::io::stderr())),
            TraceSink::File => {
                let path = config
                    .trace_file
                    .clone()
                    .unwrap_or_else(|| "instructions.log".into());
                Some(Box::new(
                    std::fs::File::create(path).map_err(ExecutionError::TraceSink)?,
                ))
            }
        };
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            program,
            config,
            solver,
            memory: MemoryManager::new(),
            states: HashMap::new(),
            searcher,
            added: Vec::new(),
            removed: Vec::new(),
            next_state_id: 1,
            test_cases: Vec::new(),
            halt: false,
            globals: HashMap::new(),
            ptree: ProcessTree::default(),
            fork_counts: HashMap::new(),
            at_memory_limit: false,
            trace_sink,
            rng,
            instructions: 0,
            current_step_state: 0,
            deferred_survivor: None,
        })
    }

    fn constraint_config(&self) -> ConstraintConfig {
        ConstraintConfig {
            rewrite_equalities: self.config.rewrite_equalities,
            equality_substitution: self.config.equality_substitution,
            use_independent: true,
        }
    }

    fn fresh_state_id(&mut self) -> StateId {
        let id = self.next_state_id;
        self.next_state_id += 1;
        id
    }

    fn setup_initial_state(
        &mut self,
        replay: Option<Vec<PathEntry>>,
    ) -> Result<ExecutionState, ExecutionError> {
        let entry = self.program.entry;
        let function = self
            .program
            .functions
            .get(entry as usize)
            .ok_or(ExecutionError::NoEntry)?;
        let id = self.fresh_state_id();
        let mut state = ExecutionState::new(
            id,
            entry,
            function,
            ConstraintManager::new(self.constraint_config()),
        );
        for (index, global) in self.program.globals.iter().enumerate() {
            let object = self.memory.allocate(
                global.size,
                false,
                true,
                &global.name,
                8,
                None,
            );
            let os = ObjectState::concrete(object.clone(), &global.init);
            state.address_space.bind(object.clone(), os);
            object.set_read_only(global.read_only);
            self.globals.insert(index as GlobalId, object);
        }
        if let Some(entries) = replay {
            state.replay = Some(crate::path::ReplayCursor::new(entries));
        }
        state.ptree_node = self.ptree.root(id);
        Ok(state)
    }

    /// Drives the engine to completion: step states until none remain or a
    /// halt condition fires, then dump a test for every survivor.
    pub fn run(&mut self, replay: Option<Vec<PathEntry>>) -> Result<RunSummary, ExecutionError> {
        let initial = self.setup_initial_state(replay)?;
        let initial_id = initial.id;
        self.states.insert(initial_id, initial);
        self.searcher.update(&[initial_id], &[]);

        let deadline = self.config.max_time.map(|t| Instant::now() + t);
        info!(
            "executing {} ({} functions, {} globals)",
            self.program.function(self.program.entry).name,
            self.program.functions.len(),
            self.program.globals.len()
        );

        timed_phase!("path exploration", {
            while !self.states.is_empty() && !self.halt {
                if let Some(deadline) = deadline {
                    if Instant::now() > deadline {
                        info!("wall-time budget exhausted, halting");
                        self.halt = true;
                        break;
                    }
                }
                if self.config.max_instructions != 0
                    && self.instructions >= self.config.max_instructions
                {
                    info!("instruction budget exhausted, halting");
                    self.halt = true;
                    break;
                }
                self.check_memory_pressure();
                self.flush_searcher();

                let Some(id) = self.searcher.select() else {
                    break;
                };
                let state = self
                    .states
                    .remove(&id)
                    .expect("searcher returned an unknown state");
                if let Some(survivor) = self.step(state) {
                    self.states.insert(survivor.id, survivor);
                }
                self.flush_searcher();
            }
        });

        self.dump_remaining_states();
        Ok(RunSummary {
            test_cases: std::mem::take(&mut self.test_cases),
            halted: self.halt,
            instructions: self.instructions,
        })
    }

    fn flush_searcher(&mut self) {
        if self.added.is_empty() && self.removed.is_empty() {
            return;
        }
        let added = std::mem::take(&mut self.added);
        let removed = std::mem::take(&mut self.removed);
        self.searcher.update(&added, &removed);
    }

    fn dump_remaining_states(&mut self) {
        let ids: Vec<StateId> = self.states.keys().copied().collect();
        for id in ids {
            let state = self.states.remove(&id).unwrap();
            self.terminate_early(state, "execution halting");
        }
    }

    fn check_memory_pressure(&mut self) {
        let Some(cap) = self.config.max_memory else {
            return;
        };
        if self.instructions % 256 != 0 {
            return;
        }
        let in_use: u64 = self
            .states
            .values()
            .map(|s| s.address_space.iter().map(|b| b.object.size).sum::<u64>())
            .sum();
        let above = in_use > cap.as_u64();
        if above && !self.at_memory_limit {
            warn!("memory cap reached ({} in use)", ByteSize::b(in_use));
        }
        self.at_memory_limit = above;
        if above && !self.config.max_memory_inhibit && self.states.len() > 1 {
            // Kill a random state to relieve pressure.
            let ids: Vec<StateId> = self.states.keys().copied().collect();
            let victim = ids[self.rng.gen_range(0..ids.len())];
            let state = self.states.remove(&victim).unwrap();
            self.removed.push(victim);
            self.terminate_early(state, "killed at memory cap");
        }
    }

    fn step(&mut self, mut state: ExecutionState) -> Option<ExecutionState> {
        self.instructions += 1;
        state.steps += 1;
        stats::INSTRUCTIONS.inc();

        if self.config.max_depth != 0 && state.depth > self.config.max_depth {
            self.terminate_early(state, "max branch depth exceeded");
            return None;
        }

        let pc = state.pc();
        let Some(inst) = self.program.inst(pc) else {
            self.terminate_on_error(
                state,
                TerminationKind::Exec,
                format!("no instruction at {}", pc),
            );
            return None;
        };
        let inst = inst.clone();
        if let Some(sink) = &mut self.trace_sink {
            let _ = writeln!(sink, "[{}] {}: {}", state.id, pc, inst);
        }
        trace!("[{}] {}: {}", state.id, pc, inst);

        let thread = state.thread_mut();
        thread.prev_pc = pc;
        thread.pc = pc.next();

        let selected = state.id;
        self.current_step_state = selected;
        let result = self.execute_inst(state, &inst);
        let deferred = self.deferred_survivor.take();
        self.current_step_state = 0;
        match (result, deferred) {
            (Some(survivor), None) if survivor.id == selected => Some(survivor),
            (Some(fresh), None) => {
                // The selected state died and a forked copy carries on; the
                // searcher has to learn its id.
                self.added.push(fresh.id);
                self.states.insert(fresh.id, fresh);
                None
            }
            (Some(fresh), Some(survivor)) => {
                debug_assert_eq!(survivor.id, selected);
                self.added.push(fresh.id);
                self.states.insert(fresh.id, fresh);
                Some(survivor)
            }
            (None, deferred) => deferred,
        }
    }

    /// Stages a state produced during the current step. A state still
    /// carrying the selected id becomes the step's survivor instead, so the
    /// searcher never tracks one id twice.
    pub(crate) fn stage_state(&mut self, state: ExecutionState) {
        if state.id == self.current_step_state {
            debug_assert!(self.deferred_survivor.is_none());
            self.deferred_survivor = Some(state);
            return;
        }
        self.added.push(state.id);
        self.states.insert(state.id, state);
    }

    // ------------------------------------------------------------------
    // Forking

    fn fork_inhibited(&self, state: &ExecutionState) -> bool {
        (self.at_memory_limit && self.config.max_memory_inhibit)
            || state.fork_disabled
            || stats::FORKS.get() >= self.config.max_forks
    }

    /// Per-instruction fork budget: when one site owns more than the
    /// configured share of all forks, concretize instead of forking.
    fn over_fork_budget(&self, tag: InstTag) -> bool {
        if self.config.max_static_fork_pct >= 1.0 {
            return false;
        }
        let total = stats::FORKS.get();
        if total < 32 {
            return false;
        }
        let here = self.fork_counts.get(&tag).copied().unwrap_or(0);
        (here as f64) > (total as f64) * self.config.max_static_fork_pct
    }

    /// Two-way fork on `condition`. Internal forks are never recorded and
    /// never consult the replay stream.
    pub(crate) fn fork(
        &mut self,
        mut state: ExecutionState,
        mut condition: ExprRef,
        internal: bool,
    ) -> ForkOutcome {
        let tag = state.prev_pc().tag();
        if !internal && !condition.is_constant() && self.over_fork_budget(tag) {
            match self.solver.get_value(&state.constraints, &condition) {
                Ok(value) => {
                    debug!("fork budget exceeded at {}, concretizing", tag);
                    if !state
                        .constraints
                        .add(Expr::eq(Expr::constant(value), condition.clone()))
                    {
                        self.terminate_on_error(
                            state,
                            TerminationKind::Abort,
                            "concretization made the path infeasible".into(),
                        );
                        return ForkOutcome::Terminated;
                    }
                    condition = Expr::constant(value);
                }
                Err(SolverError::Timeout) => {}
                Err(e) => {
                    warn!("solver failed while concretizing: {}", e);
                }
            }
        }

        // Replay consults the recorded decision instead of forking; the
        // solver verdict is still computed to catch divergent streams.
        if !internal && state.replay.is_some() && !condition.is_constant() {
            return self.fork_replay(state, condition);
        }

        let verdict = if condition.as_constant().is_some() {
            Ok(if condition.is_true() {
                Validity::True
            } else {
                Validity::False
            })
        } else {
            self.solver.evaluate(&state.constraints, &condition)
        };

        match verdict {
            Ok(Validity::True) => {
                if !internal && !self.record_branch(&mut state, true) {
                    self.terminate_on_error(
                        state,
                        TerminationKind::ReplayPath,
                        "recorded decision contradicts a proven branch".into(),
                    );
                    return ForkOutcome::Terminated;
                }
                ForkOutcome::True(state)
            }
            Ok(Validity::False) => {
                if !internal && !self.record_branch(&mut state, false) {
                    self.terminate_on_error(
                        state,
                        TerminationKind::ReplayPath,
                        "recorded decision contradicts a proven branch".into(),
                    );
                    return ForkOutcome::Terminated;
                }
                ForkOutcome::False(state)
            }
            Ok(Validity::Unknown) => {
                if self.fork_inhibited(&state) {
                    let taken: bool = self.rng.gen();
                    warn!("skipping fork (inhibited), taking {} branch", taken);
                    self.one_sided(state, condition, taken, internal)
                } else {
                    self.fork_both(state, condition, internal)
                }
            }
            Err(SolverError::Timeout) => {
                if self.fork_inhibited(&state) {
                    let taken: bool = self.rng.gen();
                    warn!("fork query timed out (inhibited), taking {} branch", taken);
                    self.one_sided(state, condition, taken, internal)
                } else {
                    state.rewind_pc();
                    self.terminate_early(state, "query timed out (fork)");
                    ForkOutcome::Terminated
                }
            }
            Err(e) => {
                warn!("fatal solver failure at fork: {}", e);
                self.terminate_on_solver_failure(state, e);
                ForkOutcome::Terminated
            }
        }
    }

    fn fork_replay(&mut self, mut state: ExecutionState, condition: ExprRef) -> ForkOutcome {
        let Some(PathEntry::Fork { taken }) =
            state.replay.as_mut().and_then(|cursor| cursor.next())
        else {
            self.terminate_on_error(
                state,
                TerminationKind::ReplayPath,
                "branch reached but the recorded stream has no fork entry".into(),
            );
            return ForkOutcome::Terminated;
        };
        // The recorded bit decides the direction, but it must not
        // contradict anything the solver can prove about this path; a
        // corrupted or mismatched stream is a fatal divergence. Timeouts
        // leave the recorded bit in charge.
        match self.solver.evaluate(&state.constraints, &condition) {
            Ok(Validity::True) if !taken => {
                self.terminate_on_error(
                    state,
                    TerminationKind::ReplayPath,
                    "recorded branch contradicts a provably true condition".into(),
                );
                return ForkOutcome::Terminated;
            }
            Ok(Validity::False) if taken => {
                self.terminate_on_error(
                    state,
                    TerminationKind::ReplayPath,
                    "recorded branch contradicts a provably false condition".into(),
                );
                return ForkOutcome::Terminated;
            }
            Ok(_) | Err(SolverError::Timeout) => {}
            Err(e) => {
                self.terminate_on_solver_failure(state, e);
                return ForkOutcome::Terminated;
            }
        }
        let constraint = if taken {
            condition
        } else {
            Expr::logical_not(condition)
        };
        state.path.record(PathEntry::Fork { taken });
        if !state.constraints.add(constraint) {
            self.terminate_on_error(
                state,
                TerminationKind::ReplayPath,
                "recorded branch decision is infeasible on this path".into(),
            );
            return ForkOutcome::Terminated;
        }
        if taken {
            ForkOutcome::True(state)
        } else {
            ForkOutcome::False(state)
        }
    }

    /// Appends the branch decision; under replay, cross-checks it against
    /// the recorded entry. False means the replay diverged.
    fn record_branch(&mut self, state: &mut ExecutionState, taken: bool) -> bool {
        state.path.record(PathEntry::Fork { taken });
        if let Some(cursor) = state.replay.as_mut() {
            match cursor.next() {
                Some(PathEntry::Fork { taken: recorded }) if recorded == taken => {}
                entry => {
                    warn!(
                        "replay divergence at {}: expected fork {}, got {:?}",
                        state.prev_pc(),
                        taken,
                        entry
                    );
                    return false;
                }
            }
        }
        true
    }

    fn one_sided(
        &mut self,
        mut state: ExecutionState,
        condition: ExprRef,
        taken: bool,
        internal: bool,
    ) -> ForkOutcome {
        let constraint = if taken {
            condition
        } else {
            Expr::logical_not(condition)
        };
        if !internal {
            state.path.record(PathEntry::Fork { taken });
        }
        if !state.constraints.add(constraint) {
            self.terminate_on_error(
                state,
                TerminationKind::Abort,
                "adding a branch constraint made the path infeasible".into(),
            );
            return ForkOutcome::Terminated;
        }
        if taken {
            ForkOutcome::True(state)
        } else {
            ForkOutcome::False(state)
        }
    }

    fn fork_both(
        &mut self,
        mut state: ExecutionState,
        condition: ExprRef,
        internal: bool,
    ) -> ForkOutcome {
        stats::FORKS.inc();
        let tag = state.prev_pc().tag();
        *self.fork_counts.entry(tag).or_insert(0) += 1;

        let false_id = self.fresh_state_id();
        let mut false_state = state.branch(false_id);
        state.depth += 1;
        false_state.depth += 1;

        let (true_node, false_node) = self.ptree.attach(state.ptree_node, state.id, false_id);
        state.ptree_node = true_node;
        false_state.ptree_node = false_node;

        if !internal {
            state.path.record(PathEntry::Fork { taken: true });
            false_state.path.record(PathEntry::Fork { taken: false });
            state.sym_path.push('1');
            false_state.sym_path.push('0');
        }

        let true_ok = state.constraints.add(condition.clone());
        let false_ok = false_state
            .constraints
            .add(Expr::logical_not(condition));
        match (true_ok, false_ok) {
            (true, true) => ForkOutcome::Both {
                on_true: state,
                on_false: false_state,
            },
            (true, false) => {
                self.terminate_early(false_state, "fork side became infeasible");
                ForkOutcome::True(state)
            }
            (false, true) => {
                self.terminate_early(state, "fork side became infeasible");
                ForkOutcome::False(false_state)
            }
            (false, false) => {
                self.terminate_early(state, "fork side became infeasible");
                self.terminate_early(false_state, "fork side became infeasible");
                ForkOutcome::Terminated
            }
        }
    }

    // ------------------------------------------------------------------
    // Concretization

    /// Samples a feasible value for `expr` and pins it with an equality.
    pub(crate) fn concretize(
        &mut self,
        state: &mut ExecutionState,
        expr: &ExprRef,
        reason: &str,
    ) -> Result<BitVec, SolverError> {
        if let Some(v) = expr.as_constant() {
            return Ok(v);
        }
        let value = self.solver.get_value(&state.constraints, expr)?;
        debug!("concretizing ({}) {} = {}", reason, expr, value);
        if !state
            .constraints
            .add(Expr::eq(Expr::constant(value), expr.clone()))
        {
            return Err(SolverError::Backend(
                "concretization made the path infeasible".into(),
            ));
        }
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Memory operations

    /// Load or store at `address`. The fast path resolves a unique object
    /// and bounds-checks; everything else walks every candidate object,
    /// forking per resolution, and flags the infeasible remainder.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_memory_operation(
        &mut self,
        mut state: ExecutionState,
        is_write: bool,
        mut address: ExprRef,
        value: Option<ExprRef>,
        target: Option<crate::llir::ValueId>,
        width: Width,
    ) -> Option<ExecutionState> {
        // A write's footprint is the stored value's width.
        let effective_width = match (&value, width) {
            (Some(v), _) if is_write => v.width(),
            _ => width,
        };
        let bytes = u64::from((effective_width + 7) / 8).max(1);
        if self.config.simplify_sym_indices && !address.is_constant() {
            address = state.constraints.simplify(&address);
        }

        // Fast path: locate the object a sampled address lands in.
        let example = if let Some(v) = address.as_constant() {
            Some(v.as_u64())
        } else {
            match self.solver.get_value(&state.constraints, &address) {
                Ok(v) => Some(v.as_u64()),
                Err(SolverError::Timeout) => None,
                Err(e) => {
                    self.terminate_on_solver_failure(state, e);
                    return None;
                }
            }
        };

        if let Some(example) = example {
            if let Some(binding) = state.address_space.find(example) {
                let object = binding.object.clone();

                // Large objects concretize symbolic indices outright.
                if self.config.max_sym_array_size != 0
                    && object.size >= self.config.max_sym_array_size
                    && !address.is_constant()
                {
                    match self.concretize(&mut state, &address, "max-sym-array-size") {
                        Ok(v) => address = Expr::constant(v),
                        Err(SolverError::Timeout) => {
                            state.rewind_pc();
                            self.terminate_early(state, "query timed out (concretization)");
                            return None;
                        }
                        Err(e) => {
                            self.terminate_on_solver_failure(state, e);
                            return None;
                        }
                    }
                }

                let offset = object.offset_of(address.clone());
                let in_bounds = if self.config.check_out_of_bounds {
                    let check = object.bounds_check_offset(offset.clone(), bytes);
                    match self.solver.must_be_true(&state.constraints, &check) {
                        Ok(v) => v,
                        Err(SolverError::Timeout) => {
                            state.rewind_pc();
                            self.terminate_early(state, "query timed out (bounds check)");
                            return None;
                        }
                        Err(e) => {
                            self.terminate_on_solver_failure(state, e);
                            return None;
                        }
                    }
                } else {
                    true
                };

                if in_bounds {
                    return self.access_object(state, &object, offset, is_write, value, target, width);
                }
            }
        }

        // Slow path: unresolved, out of bounds, or multiple candidates.
        warn!(
            "[{}] unresolved memory access, forking over candidates",
            state.id
        );
        let candidates: Vec<MemoryObjectRef> = state
            .address_space
            .iter()
            .map(|b| b.object.clone())
            .collect();
        let mut unbound = Some(state);
        let mut incomplete = false;
        for object in candidates {
            let Some(current) = unbound.take() else {
                break;
            };
            let in_bounds = object.bounds_check_pointer(address.clone(), bytes);
            let feasible = match self.solver.may_be_true(&current.constraints, &in_bounds) {
                Ok(v) => v,
                Err(SolverError::Timeout) => {
                    incomplete = true;
                    false
                }
                Err(e) => {
                    self.terminate_on_solver_failure(current, e);
                    return None;
                }
            };
            if !feasible {
                unbound = Some(current);
                continue;
            }
            match self.fork(current, in_bounds, true) {
                ForkOutcome::True(bound) => {
                    let offset = object.offset_of(address.clone());
                    if let Some(serviced) = self.access_object(
                        bound,
                        &object,
                        offset,
                        is_write,
                        value.clone(),
                        target,
                        width,
                    ) {
                        self.stage_state(serviced);
                    }
                    unbound = None;
                }
                ForkOutcome::False(rest) => {
                    unbound = Some(rest);
                }
                ForkOutcome::Both {
                    on_true: bound,
                    on_false: rest,
                } => {
                    let offset = object.offset_of(address.clone());
                    if let Some(serviced) = self.access_object(
                        bound,
                        &object,
                        offset,
                        is_write,
                        value.clone(),
                        target,
                        width,
                    ) {
                        self.stage_state(serviced);
                    }
                    unbound = Some(rest);
                }
                ForkOutcome::Terminated => {
                    unbound = None;
                }
            }
        }
        if let Some(rest) = unbound {
            if incomplete {
                self.terminate_early(rest, "query timed out (resolve)");
            } else {
                let info = self.address_info(&rest, &address);
                self.terminate_on_error(
                    rest,
                    TerminationKind::Ptr,
                    format!("memory error: out of bound pointer{}", info),
                );
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn access_object(
        &mut self,
        mut state: ExecutionState,
        object: &MemoryObjectRef,
        offset: ExprRef,
        is_write: bool,
        value: Option<ExprRef>,
        target: Option<crate::llir::ValueId>,
        width: Width,
    ) -> Option<ExecutionState> {
        let tag = Some(state.prev_pc().tag());
        if is_write {
            if object.is_read_only() {
                self.terminate_on_error(
                    state,
                    TerminationKind::ReadOnly,
                    "memory error: object read only".into(),
                );
                return None;
            }
            let value = value.expect("write without a value");
            let os = state
                .address_space
                .get_writable(object.address)
                .expect("writable binding disappeared");
            match offset.as_constant() {
                Some(o) => os.write(o.as_u64(), value, tag),
                None => os.write_symbolic(offset, value, tag),
            }
            Some(state)
        } else {
            let result = match offset.as_constant() {
                Some(o) => {
                    let binding = state
                        .address_space
                        .binding_at(object.address)
                        .expect("binding disappeared");
                    binding.state.read(o.as_u64(), width)
                }
                None => {
                    // Symbolic indexing flushes byte caches, so it needs
                    // the writable view even for a load.
                    let os = state
                        .address_space
                        .get_writable(object.address)
                        .expect("writable binding disappeared");
                    os.read_symbolic(offset, width)
                }
            };
            if let Some(dst) = target {
                self.bind_dest(&mut state, dst, result);
            }
            Some(state)
        }
    }

    /// Optional detail for pointer errors, per the address-info level.
    fn address_info(&mut self, state: &ExecutionState, address: &ExprRef) -> String {
        match self.config.address_info {
            AddressInfoLevel::None => format!("\n\taddress: {}", address),
            AddressInfoLevel::Full => {
                let mut info = format!("\n\taddress: {}", address);
                if let Ok(example) = self.solver.get_value(&state.constraints, address) {
                    info.push_str(&format!("\n\texample: {:#x}", example.as_u64()));
                    let example = example.as_u64();
                    let mut nearest: Option<(&MemoryObjectRef, u64)> = None;
                    for binding in state.address_space.iter() {
                        let distance = binding.object.address.abs_diff(example);
                        if nearest.map_or(true, |(_, d)| distance < d) {
                            nearest = Some((&binding.object, distance));
                        }
                    }
                    if let Some((object, _)) = nearest {
                        info.push_str(&format!("\n\tnearest object: {}", object));
                    }
                }
                info
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduling

    /// Advances to the next enabled thread, records the decision, and
    /// cross-checks the replay stream. `None` means the state died.
    pub(crate) fn schedule(&mut self, mut state: ExecutionState) -> Option<ExecutionState> {
        let Some(next) = state.schedule_next() else {
            self.terminate_on_error(
                state,
                TerminationKind::User,
                "hang: every thread is disabled (possible deadlock)".into(),
            );
            return None;
        };
        state.path.record(PathEntry::Schedule { thread: next });
        if let Some(cursor) = state.replay.as_mut() {
            match cursor.next() {
                Some(PathEntry::Schedule { thread }) if thread == next => {}
                entry => warn!(
                    "replay scheduling mismatch: chose thread {}, recorded {:?}",
                    next, entry
                ),
            }
        }
        trace!("[{}] context switch to thread {}", state.id, next);
        Some(state)
    }

    // ------------------------------------------------------------------
    // Termination

    pub(crate) fn terminate_on_exit(&mut self, state: ExecutionState, code: u64) {
        self.emit_test_case(state, ExitReason::Exit { code });
    }

    pub(crate) fn terminate_early(&mut self, state: ExecutionState, message: &str) {
        debug!("[{}] terminating early: {}", state.id, message);
        self.emit_test_case(state, ExitReason::Early(message.to_owned()));
    }

    /// Hard solver failures (as opposed to timeouts) are fatal to the
    /// engine: the state dies and exploration halts.
    pub(crate) fn terminate_on_solver_failure(&mut self, state: ExecutionState, error: SolverError) {
        self.halt = true;
        self.terminate_on_error(
            state,
            TerminationKind::Exec,
            format!("solver failure: {}", error),
        );
    }

    pub(crate) fn terminate_on_error(
        &mut self,
        state: ExecutionState,
        kind: TerminationKind,
        message: String,
    ) {
        warn!("[{}] {}: {}", state.id, kind, message);
        if self.config.exit_on_error_kind == Some(kind) {
            info!("halting on first {} error", kind);
            self.halt = true;
        }
        self.emit_test_case(state, ExitReason::Error { kind, message });
    }

    fn emit_test_case(&mut self, state: ExecutionState, reason: ExitReason) {
        stats::STATES_TERMINATED.inc();
        let arrays: Vec<_> = state.symbolics.iter().map(|(_, a)| a.clone()).collect();
        let objects = if arrays.is_empty() {
            Vec::new()
        } else {
            match self.solver.get_initial_values(&state.constraints, &arrays) {
                Ok(Some(assignment)) => state
                    .symbolics
                    .iter()
                    .map(|(_, array)| {
                        let bytes = assignment
                            .bytes_for(array)
                            .map(|b| b.to_vec())
                            .unwrap_or_else(|| vec![0; array.size() as usize]);
                        (array.name().to_owned(), bytes)
                    })
                    .collect(),
                Ok(None) => {
                    warn!("[{}] terminated state has no model", state.id);
                    Vec::new()
                }
                Err(e) => {
                    warn!("[{}] cannot compute a witness: {}", state.id, e);
                    Vec::new()
                }
            }
        };
        let test = TestCase {
            state_id: state.id,
            objects,
            reason,
            path: state.path.entries().to_vec(),
            sym_path: state.sym_path.clone(),
            stack_trace: state.stack_trace(self.program),
            constraints: state.constraints_dump(),
            stats: format!(
                "steps: {}\ndepth: {}\nconstraints: {}\n",
                state.steps,
                state.depth,
                state.constraints.len()
            ),
        };
        debug!("[{}] test case: {}", state.id, test.reason);
        self.removed.push(state.id);
        self.test_cases.push(test);
    }

    // ------------------------------------------------------------------
    // Helpers shared with dispatch

    pub(crate) fn bind_dest(
        &self,
        state: &mut ExecutionState,
        dst: crate::llir::ValueId,
        expr: ExprRef,
    ) {
        // First-occur tag migration: once an expression is owned by a
        // recording site, later bindings keep the cheaper original owner.
        let tag = state.prev_pc().tag();
        if expr.tag().is_none() {
            expr.set_tag(Some(tag));
        }
        state.bind_local(dst, expr);
    }

    pub(crate) fn jump(&self, state: &mut ExecutionState, block: crate::llir::BlockId) {
        let current = state.prev_pc().block;
        let thread = state.thread_mut();
        thread.incoming_block = Some(current);
        thread.pc = CodePtr::block_start(thread.pc.func, block);
    }

    pub(crate) fn function_entry(&self, func: FuncId) -> CodePtr {
        CodePtr::entry(func)
    }
}

pub(crate) fn pointer_constant(value: u64) -> ExprRef {
    Expr::constant_u64(value, PTR_WIDTH)
}
