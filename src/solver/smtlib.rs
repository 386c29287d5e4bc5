//! SMT-LIB2 back-end over a child solver process (z3 by default).
//!
//! Queries are emitted as QF_ABV with one `define-fun` per DAG node so
//! shared subtrees stay shared in the text. Models are pulled back with
//! per-byte `get-value` selects.

use super::{Query, SolverError, SolverImpl, SolverResult};
use crate::expr::{
    ArrayRef, Assignment, BinaryOp, BitVec, CompareOp, ExprKind, ExprRef, UpdateList,
};
use crate::constraints::IndependentSet;
use log::{debug, trace};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write as IoWrite};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;
use std::time::Duration;

pub struct SmtLibSolver {
    path: PathBuf,
    timeout: Option<Duration>,
    process: Option<Process>,
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.stdin.write_all(b"(exit)\n");
        let _ = self.child.wait();
    }
}

impl SmtLibSolver {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            timeout: None,
            process: None,
        }
    }

    fn ensure_process(&mut self) -> SolverResult<&mut Process> {
        if self.process.is_none() {
            let mut command = Command::new(&self.path);
            if self
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.contains("z3"))
            {
                command.arg("-in").arg("-smt2");
            }
            let mut child = command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| SolverError::Backend(format!("cannot spawn {:?}: {}", self.path, e)))?;
            let stdin = child.stdin.take().expect("piped stdin");
            let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
            let mut process = Process {
                child,
                stdin,
                stdout,
            };
            write!(
                process.stdin,
                "(set-option :print-success false)\n(set-option :produce-models true)\n(set-logic QF_ABV)\n"
            )
            .map_err(io_err)?;
            self.process = Some(process);
        }
        Ok(self.process.as_mut().unwrap())
    }

    fn read_answer(process: &mut Process) -> SolverResult<String> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = process.stdout.read_line(&mut line).map_err(io_err)?;
            if n == 0 {
                return Err(SolverError::Backend("solver process closed its pipe".into()));
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_owned());
            }
        }
    }

    /// Checks satisfiability of the conjunction; on sat optionally reads a
    /// byte model for the given arrays.
    fn probe(
        &mut self,
        set: &[ExprRef],
        model_arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        let timeout = self.timeout;
        let mut script = String::from("(push 1)\n");
        let mut translator = Translator::default();
        for e in set {
            let term = translator.term(e);
            translator.asserts.push_str(&format!("(assert (= {} #b1))\n", term));
        }
        for array in model_arrays {
            translator.declare_array(array);
        }
        script.push_str(&translator.declarations);
        script.push_str(&translator.definitions);
        script.push_str(&translator.asserts);
        if let Some(t) = timeout {
            script.push_str(&format!("(set-option :timeout {})\n", t.as_millis()));
        }
        script.push_str("(check-sat)\n");
        trace!("smtlib query:\n{}", script);

        let array_symbols: Vec<(ArrayRef, String)> = model_arrays
            .iter()
            .filter(|a| a.is_symbolic())
            .map(|a| (a.clone(), translator.array_symbol(a)))
            .collect();

        let process = self.ensure_process()?;
        process.stdin.write_all(script.as_bytes()).map_err(io_err)?;
        process.stdin.flush().map_err(io_err)?;
        let verdict = Self::read_answer(process)?;
        debug!("smtlib answer: {}", verdict);
        let result = match verdict.as_str() {
            "unsat" => Ok(None),
            "unknown" => Err(SolverError::Timeout),
            "sat" => {
                let mut assignment = Assignment::new(true);
                for (array, symbol) in &array_symbols {
                    let mut bytes = Vec::with_capacity(array.size() as usize);
                    for i in 0..array.size() {
                        write!(
                            process.stdin,
                            "(get-value ((select {} (_ bv{} 32))))\n",
                            symbol, i
                        )
                        .map_err(io_err)?;
                        process.stdin.flush().map_err(io_err)?;
                        let line = Self::read_answer(process)?;
                        bytes.push(parse_byte(&line)?);
                    }
                    assignment.bind(array, bytes);
                }
                Ok(Some(assignment))
            }
            other => Err(SolverError::Backend(format!(
                "unexpected solver answer: {}",
                other
            ))),
        };
        let process = self.process.as_mut().unwrap();
        process.stdin.write_all(b"(pop 1)\n").map_err(io_err)?;
        process.stdin.flush().map_err(io_err)?;
        result
    }
}

fn io_err(e: std::io::Error) -> SolverError {
    SolverError::Backend(format!("solver pipe error: {}", e))
}

fn parse_byte(line: &str) -> SolverResult<u8> {
    if let Some(pos) = line.rfind("#x") {
        let hex: String = line[pos + 2..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        return u8::from_str_radix(&hex, 16)
            .map_err(|_| SolverError::Backend(format!("bad model byte: {}", line)));
    }
    if let Some(pos) = line.rfind("#b") {
        let bits: String = line[pos + 2..]
            .chars()
            .take_while(|c| *c == '0' || *c == '1')
            .collect();
        return u8::from_str_radix(&bits, 2)
            .map_err(|_| SolverError::Backend(format!("bad model byte: {}", line)));
    }
    if let Some(pos) = line.rfind("(_ bv") {
        let digits: String = line[pos + 5..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        return digits
            .parse::<u8>()
            .map_err(|_| SolverError::Backend(format!("bad model byte: {}", line)));
    }
    Err(SolverError::Backend(format!("unparsable model: {}", line)))
}

#[derive(Default)]
struct Translator {
    names: HashMap<usize, String>,
    arrays: HashMap<u64, String>,
    declarations: String,
    definitions: String,
    asserts: String,
    counter: u32,
}

impl Translator {
    fn array_symbol(&mut self, array: &ArrayRef) -> String {
        if let Some(existing) = self.arrays.get(&array.id()) {
            return existing.clone();
        }
        self.declare_array(array);
        self.arrays[&array.id()].clone()
    }

    fn declare_array(&mut self, array: &ArrayRef) {
        if self.arrays.contains_key(&array.id()) {
            return;
        }
        let symbol = format!("|{}#{}|", array.name(), array.id());
        self.declarations.push_str(&format!(
            "(declare-fun {} () (Array (_ BitVec 32) (_ BitVec 8)))\n",
            symbol
        ));
        if array.is_constant() {
            for (i, v) in array.constant_values().iter().enumerate() {
                self.asserts.push_str(&format!(
                    "(assert (= (select {} (_ bv{} 32)) (_ bv{} 8)))\n",
                    symbol,
                    i,
                    v.bits()
                ));
            }
        }
        self.arrays.insert(array.id(), symbol);
    }

    fn update_term(&mut self, updates: &UpdateList) -> String {
        let base = self.array_symbol(updates.root());
        // Stores apply oldest-first.
        let nodes: Vec<_> = updates.iter().collect();
        let mut term = base;
        for node in nodes.into_iter().rev() {
            let index = self.term(&node.index);
            let value = self.term(&node.value);
            term = format!("(store {} {} {})", term, index, value);
        }
        term
    }

    fn term(&mut self, e: &ExprRef) -> String {
        let key = Rc::as_ptr(e) as usize;
        if let Some(name) = self.names.get(&key) {
            return name.clone();
        }
        let body = match e.kind() {
            ExprKind::Constant(v) => format!("(_ bv{} {})", v.bits(), v.width()),
            ExprKind::NotOptimized(inner) => self.term(inner),
            ExprKind::Read { updates, index } => {
                let array_term = self.update_term(updates);
                let index_term = self.term(index);
                format!("(select {} {})", array_term, index_term)
            }
            ExprKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                let c = self.term(cond);
                let t = self.term(on_true);
                let f = self.term(on_false);
                format!("(ite (= {} #b1) {} {})", c, t, f)
            }
            ExprKind::Concat { left, right } => {
                let l = self.term(left);
                let r = self.term(right);
                format!("(concat {} {})", l, r)
            }
            ExprKind::Extract { src, offset } => {
                let s = self.term(src);
                format!("((_ extract {} {}) {})", offset + e.width() - 1, offset, s)
            }
            ExprKind::ZExt(src) => {
                let s = self.term(src);
                format!("((_ zero_extend {}) {})", e.width() - src.width(), s)
            }
            ExprKind::SExt(src) => {
                let s = self.term(src);
                format!("((_ sign_extend {}) {})", e.width() - src.width(), s)
            }
            ExprKind::Not(src) => format!("(bvnot {})", self.term(src)),
            ExprKind::Binary { op, left, right } => {
                let l = self.term(left);
                let r = self.term(right);
                format!("({} {} {})", binary_op(*op), l, r)
            }
            ExprKind::Compare { op, left, right } => {
                let l = self.term(left);
                let r = self.term(right);
                match op {
                    CompareOp::Eq => format!("(ite (= {} {}) #b1 #b0)", l, r),
                    CompareOp::Ult => format!("(ite (bvult {} {}) #b1 #b0)", l, r),
                    CompareOp::Ule => format!("(ite (bvule {} {}) #b1 #b0)", l, r),
                    CompareOp::Slt => format!("(ite (bvslt {} {}) #b1 #b0)", l, r),
                    CompareOp::Sle => format!("(ite (bvsle {} {}) #b1 #b0)", l, r),
                }
            }
        };
        self.counter += 1;
        let name = format!("t{}", self.counter);
        self.definitions.push_str(&format!(
            "(define-fun {} () (_ BitVec {}) {})\n",
            name,
            e.width(),
            body
        ));
        self.names.insert(key, name.clone());
        name
    }
}

fn binary_op(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "bvadd",
        BinaryOp::Sub => "bvsub",
        BinaryOp::Mul => "bvmul",
        BinaryOp::UDiv => "bvudiv",
        BinaryOp::SDiv => "bvsdiv",
        BinaryOp::URem => "bvurem",
        BinaryOp::SRem => "bvsrem",
        BinaryOp::And => "bvand",
        BinaryOp::Or => "bvor",
        BinaryOp::Xor => "bvxor",
        BinaryOp::Shl => "bvshl",
        BinaryOp::LShr => "bvlshr",
        BinaryOp::AShr => "bvashr",
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

impl SolverImpl for SmtLibSolver {
    fn name(&self) -> &'static str {
        "smtlib"
    }

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let mut set = query.constraints.to_vec();
        set.push(crate::expr::Expr::logical_not(query.expr.clone()));
        Ok(self.probe(&set, &[])?.is_none())
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec> {
        let mut wanted = footprint(query.constraints);
        wanted.extend(footprint(std::slice::from_ref(&query.expr)));
        wanted.sort_by_key(|a| a.id());
        wanted.dedup_by_key(|a| a.id());
        match self.probe(query.constraints, &wanted)? {
            Some(a) => a
                .evaluate(&query.expr)
                .ok_or_else(|| SolverError::Backend("unevaluable value query".into())),
            None => Err(SolverError::Backend(
                "value query over an infeasible path".into(),
            )),
        }
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        let mut set = query.constraints.to_vec();
        if !query.expr.is_false() {
            set.push(crate::expr::Expr::logical_not(query.expr.clone()));
        }
        let mut wanted = footprint(&set);
        wanted.extend(arrays.iter().cloned());
        wanted.sort_by_key(|a| a.id());
        wanted.dedup_by_key(|a| a.id());
        match self.probe(&set, &wanted)? {
            None => Ok(None),
            Some(mut assignment) => {
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
        self.timeout = timeout;
    }
}
