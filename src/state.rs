//! Per-path execution snapshots: stack frames, cooperative threads, and
//! the state a fork duplicates.

use crate::constraints::ConstraintManager;
use crate::expr::{ArrayRef, ExprRef};
use crate::llir::{BlockId, CodePtr, FuncId, Function, Program, ValueId};
use crate::memory::{AddressSpace, MemoryObjectRef};
use crate::path::{PathRecorder, ReplayCursor};
use crate::stats;
use indexmap::IndexMap;
use std::collections::HashSet;

pub type StateId = u64;
pub type ThreadId = u64;

#[derive(Clone)]
pub struct StackFrame {
    pub func: FuncId,
    /// Return site and destination register of the call that pushed this
    /// frame; `None` for the entry frame.
    pub caller: Option<(CodePtr, Option<ValueId>)>,
    pub locals: Vec<Option<ExprRef>>,
    /// Stack allocations to unbind when the frame pops.
    pub allocas: Vec<MemoryObjectRef>,
    /// Backing object of the variadic area, when the callee is vararg.
    pub varargs: Option<MemoryObjectRef>,
}

impl StackFrame {
    pub fn new(func: FuncId, function: &Function, caller: Option<(CodePtr, Option<ValueId>)>) -> Self {
        Self {
            func,
            caller,
            locals: vec![None; function.locals as usize],
            allocas: Vec::new(),
            varargs: None,
        }
    }
}

#[derive(Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub pc: CodePtr,
    pub prev_pc: CodePtr,
    pub stack: Vec<StackFrame>,
    pub enabled: bool,
    /// Block the current block was entered from, for phi evaluation.
    pub incoming_block: Option<BlockId>,
}

impl Thread {
    fn new(id: ThreadId, func: FuncId, function: &Function) -> Self {
        let entry = CodePtr::entry(func);
        Thread {
            id,
            pc: entry,
            prev_pc: entry,
            stack: vec![StackFrame::new(func, function, None)],
            enabled: true,
            incoming_block: None,
        }
    }
}

#[derive(Clone)]
pub struct ExecutionState {
    pub id: StateId,
    threads: IndexMap<ThreadId, Thread>,
    current_thread: ThreadId,
    next_thread_id: ThreadId,
    pub address_space: AddressSpace,
    pub constraints: ConstraintManager,
    pub path: PathRecorder,
    /// Textual '1'/'0' shadow of the symbolic branch decisions.
    pub sym_path: String,
    pub replay: Option<ReplayCursor>,
    /// Symbolic branch depth.
    pub depth: u32,
    pub fork_disabled: bool,
    /// Objects made symbolic, in creation order, with their arrays.
    pub symbolics: Vec<(MemoryObjectRef, ArrayRef)>,
    pub array_names: HashSet<String>,
    pub steps: u64,
    pub ptree_node: usize,
}

impl ExecutionState {
    pub fn new(id: StateId, func: FuncId, function: &Function, constraints: ConstraintManager) -> Self {
        stats::STATES_CREATED.inc();
        let mut threads = IndexMap::new();
        threads.insert(0, Thread::new(0, func, function));
        Self {
            id,
            threads,
            current_thread: 0,
            next_thread_id: 1,
            address_space: AddressSpace::new(),
            constraints,
            path: PathRecorder::default(),
            sym_path: String::new(),
            replay: None,
            depth: 0,
            fork_disabled: false,
            symbolics: Vec::new(),
            array_names: HashSet::new(),
            steps: 0,
            ptree_node: 0,
        }
    }

    /// Duplicates this state for the other side of a fork.
    pub fn branch(&self, id: StateId) -> Self {
        stats::STATES_CREATED.inc();
        let mut child = self.clone();
        child.id = id;
        child
    }

    pub fn thread(&self) -> &Thread {
        &self.threads[&self.current_thread]
    }

    pub fn thread_mut(&mut self) -> &mut Thread {
        self.threads.get_mut(&self.current_thread).unwrap()
    }

    pub fn thread_by_id_mut(&mut self, id: ThreadId) -> &mut Thread {
        self.threads.get_mut(&id).expect("unknown thread")
    }

    pub fn thread_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.keys().copied()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn enabled_count(&self) -> usize {
        self.threads.values().filter(|t| t.enabled).count()
    }

    pub fn current_thread_id(&self) -> ThreadId {
        self.current_thread
    }

    pub fn pc(&self) -> CodePtr {
        self.thread().pc
    }

    pub fn prev_pc(&self) -> CodePtr {
        self.thread().prev_pc
    }

    pub fn set_pc(&mut self, pc: CodePtr) {
        self.thread_mut().pc = pc;
    }

    /// Rewind after an aborted instruction so the termination record names
    /// the faulting site.
    pub fn rewind_pc(&mut self) {
        let thread = self.thread_mut();
        thread.pc = thread.prev_pc;
    }

    pub fn frame(&self) -> &StackFrame {
        self.thread().stack.last().expect("empty call stack")
    }

    pub fn frame_mut(&mut self) -> &mut StackFrame {
        self.thread_mut().stack.last_mut().expect("empty call stack")
    }

    pub fn stack_depth(&self) -> usize {
        self.thread().stack.len()
    }

    pub fn local(&self, value: ValueId) -> Option<&ExprRef> {
        self.frame().locals[value as usize].as_ref()
    }

    pub fn bind_local(&mut self, value: ValueId, expr: ExprRef) {
        self.frame_mut().locals[value as usize] = Some(expr);
    }

    /// Creates a thread running `func`; returns its id.
    pub fn spawn_thread(&mut self, func: FuncId, function: &Function) -> ThreadId {
        let id = self.next_thread_id;
        self.next_thread_id += 1;
        self.threads.insert(id, Thread::new(id, func, function));
        id
    }

    /// Advances to the next enabled thread in creation order, wrapping
    /// around. Returns the chosen thread, or `None` when all are disabled.
    pub fn schedule_next(&mut self) -> Option<ThreadId> {
        if self.enabled_count() == 0 {
            return None;
        }
        let ids: Vec<ThreadId> = self.threads.keys().copied().collect();
        let current_pos = ids
            .iter()
            .position(|&t| t == self.current_thread)
            .unwrap_or(0);
        for step in 1..=ids.len() {
            let candidate = ids[(current_pos + step) % ids.len()];
            if self.threads[&candidate].enabled {
                self.current_thread = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Removes the current thread and switches to `next`.
    pub fn retire_thread(&mut self, retired: ThreadId, next: ThreadId) {
        self.threads.shift_remove(&retired);
        self.current_thread = next;
    }

    pub fn disable_current_thread(&mut self) {
        self.thread_mut().enabled = false;
    }

    pub fn unique_array_name(&mut self, base: &str) -> String {
        let mut candidate = base.to_owned();
        let mut counter = 0;
        while !self.array_names.insert(candidate.clone()) {
            counter += 1;
            candidate = format!("{}_{}", base, counter);
        }
        candidate
    }

    pub fn stack_trace(&self, program: &Program) -> String {
        let mut out = String::new();
        for (depth, frame) in self.thread().stack.iter().enumerate().rev() {
            let name = &program.function(frame.func).name;
            out.push_str(&format!("  #{} {}\n", depth, name));
        }
        out
    }

    /// Textual dump of the path condition, for the consPath stream.
    pub fn constraints_dump(&self) -> String {
        let mut out = String::new();
        for c in self.constraints.iter() {
            out.push_str(&format!("{}\n", c));
        }
        out
    }
}
