//! Native word-level back-end.
//!
//! A sound, deliberately incomplete decision procedure built from four
//! layers, cheapest first:
//!
//! 1. structural refutation: a false conjunct, a constraint present
//!    together with its negation, or an equality whose substitution folds
//!    some conjunct to false;
//! 2. interval reasoning: unsigned ranges derived from comparison
//!    constraints, propagated through the DAG, refuting comparisons that
//!    cannot hold;
//! 3. exhaustive enumeration when the footprint is a handful of bits;
//! 4. satisfying-assignment search: a zero probe, then inverse-value
//!    propagation down the DAG with randomized restarts under an
//!    iteration budget.
//!
//! `Sat` answers are always re-checked by evaluation; anything undecided
//! surfaces as a timeout for the caller to handle per policy.

use super::{Query, SolverError, SolverImpl, SolverResult};
use crate::constraints::IndependentSet;
use crate::expr::visitor::{ReplaceMapVisitor, RewriteDriver, UpdateNodeCache};
use crate::expr::{
    ArrayRef, Assignment, BinaryOp, BitVec, CompareOp, Expr, ExprKind, ExprRef, Width,
};
use log::trace;
use rand::prelude::*;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Footprints of at most this many free bits are enumerated exhaustively,
/// giving complete answers for tiny queries.
const ENUMERATION_BITS: u32 = 16;

/// Restart the assignment from random bytes after this many failed repair
/// steps in a row.
const RESTART_PERIOD: u64 = 32;

enum Probe {
    Sat(Assignment),
    Unsat,
    Unknown,
}

pub struct SearchSolver {
    budget: u64,
    timeout: Option<Duration>,
    rng: StdRng,
}

impl SearchSolver {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            timeout: None,
            rng: StdRng::seed_from_u64(0x9e37_79b9),
        }
    }

    fn probe(&mut self, set: &[ExprRef]) -> Probe {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        if let Some(result) = refute_structurally(set) {
            return result;
        }
        if let Some(result) = refute_by_intervals(set) {
            return result;
        }
        let arrays = footprint_arrays(set);
        let free_bits: u32 = arrays.iter().map(|a| a.size() * 8).sum();
        if free_bits <= ENUMERATION_BITS {
            return self.enumerate(set, &arrays);
        }
        self.local_search(set, &arrays, deadline)
    }

    fn enumerate(&mut self, set: &[ExprRef], arrays: &[ArrayRef]) -> Probe {
        let total_bytes: u32 = arrays.iter().map(|a| a.size()).sum();
        let combinations = 1u64 << (total_bytes * 8);
        for raw in 0..combinations {
            let mut assignment = Assignment::new(true);
            let mut rest = raw;
            for array in arrays {
                let bytes: Vec<u8> = (0..array.size())
                    .map(|_| {
                        let b = (rest & 0xff) as u8;
                        rest >>= 8;
                        b
                    })
                    .collect();
                assignment.bind(array, bytes);
            }
            if assignment.satisfies(set) == Some(true) {
                return Probe::Sat(assignment);
            }
        }
        Probe::Unsat
    }

    fn local_search(
        &mut self,
        set: &[ExprRef],
        arrays: &[ArrayRef],
        deadline: Option<Instant>,
    ) -> Probe {
        let mut assignment = Assignment::new(true);
        for array in arrays {
            assignment.bind(array, vec![0; array.size() as usize]);
        }
        let mut failed_repairs = 0u64;
        for step in 0..self.budget {
            if let Some(deadline) = deadline {
                if step % 64 == 0 && Instant::now() > deadline {
                    return Probe::Unknown;
                }
            }
            let unsatisfied = set
                .iter()
                .find(|c| assignment.evaluate_bool(c) != Some(true));
            let Some(broken) = unsatisfied else {
                debug_assert_eq!(assignment.satisfies(set), Some(true));
                return Probe::Sat(assignment);
            };
            let repaired = self.force(broken, BitVec::bool(true), &mut assignment);
            if !repaired {
                failed_repairs += 1;
                if failed_repairs % RESTART_PERIOD == 0 {
                    for array in arrays {
                        let bytes = assignment.bytes_for_mut(array);
                        for b in bytes.iter_mut() {
                            *b = self.rng.gen();
                        }
                    }
                }
            }
        }
        Probe::Unknown
    }

    /// Attempts to steer the assignment so `e` evaluates to `want` by
    /// descending through invertible operators towards array bytes.
    fn force(&mut self, e: &ExprRef, want: BitVec, a: &mut Assignment) -> bool {
        debug_assert_eq!(e.width(), want.width());
        match e.kind() {
            ExprKind::Constant(v) => *v == want,
            ExprKind::NotOptimized(inner) => self.force(inner, want, a),
            ExprKind::Read { updates, index } => {
                let Some(idx) = a.evaluate(index) else {
                    return false;
                };
                for node in updates.iter() {
                    match a.evaluate(&node.index) {
                        Some(ui) if ui == idx => return self.force(&node.value, want, a),
                        Some(_) => {}
                        None => return false,
                    }
                }
                let array = updates.root();
                if array.is_constant() {
                    return array.constant_at(idx.as_u64()) == Some(want);
                }
                if idx.as_u64() >= u64::from(array.size()) {
                    return false;
                }
                a.bytes_for_mut(array)[idx.as_u64() as usize] = want.bits() as u8;
                true
            }
            ExprKind::Select {
                cond,
                on_true,
                on_false,
            } => match a.evaluate_bool(cond) {
                Some(true) => self.force(on_true, want, a),
                Some(false) => self.force(on_false, want, a),
                None => false,
            },
            ExprKind::Concat { left, right } => {
                let hi = want.extract(right.width(), left.width());
                let lo = want.extract(0, right.width());
                self.force(left, hi, a) && self.force(right, lo, a)
            }
            ExprKind::Extract { src, offset } => {
                let Some(current) = a.evaluate(src) else {
                    return false;
                };
                let width = e.width();
                let mask = if width >= 128 {
                    u128::MAX
                } else {
                    ((1u128 << width) - 1) << offset
                };
                let spliced = (current.bits() & !mask) | (want.bits() << offset);
                self.force(src, BitVec::new(spliced, src.width()), a)
            }
            ExprKind::ZExt(src) => {
                if want.bits() >> src.width() != 0 {
                    return false;
                }
                self.force(src, want.extract(0, src.width()), a)
            }
            ExprKind::SExt(src) => {
                let trunc = want.extract(0, src.width());
                if trunc.sext(want.width()) != want {
                    return false;
                }
                self.force(src, trunc, a)
            }
            ExprKind::Not(src) => self.force(src, want.not(), a),
            ExprKind::Binary { op, left, right } => self.force_binary(*op, left, right, want, a),
            ExprKind::Compare { op, left, right } => self.force_compare(*op, left, right, want, a),
        }
    }

    fn force_binary(
        &mut self,
        op: BinaryOp,
        left: &ExprRef,
        right: &ExprRef,
        want: BitVec,
        a: &mut Assignment,
    ) -> bool {
        // With a constant on one side, compute the inverse value for the
        // other; with both symbolic, freeze the right side at its current
        // value and invert for the left.
        let (fixed, target, invert_left) = if let Some(l) = left.as_constant() {
            (l, right, false)
        } else if let Some(r) = right.as_constant() {
            (r, left, true)
        } else {
            let Some(r) = a.evaluate(right) else {
                return false;
            };
            (r, left, true)
        };
        let value = match op {
            BinaryOp::Add => want.sub(fixed),
            BinaryOp::Sub => {
                if invert_left {
                    want.add(fixed)
                } else {
                    fixed.sub(want)
                }
            }
            BinaryOp::Xor => want.xor(fixed),
            BinaryOp::And => {
                // Only solvable when the wanted bits lie under the fixed
                // mask; free bits are filled randomly.
                if want.and(fixed) != want {
                    return false;
                }
                let free = fixed.not();
                let noise = BitVec::new(self.rng.gen::<u128>(), want.width()).and(free);
                want.or(noise)
            }
            BinaryOp::Or => {
                if want.or(fixed) != want {
                    return false;
                }
                want.and(fixed.not())
            }
            BinaryOp::Mul => {
                if fixed.bits() % 2 == 1 {
                    want.mul(modular_inverse(fixed))
                } else {
                    return false;
                }
            }
            BinaryOp::UDiv if invert_left => {
                let candidate = want.mul(fixed);
                if candidate.udiv(fixed) != want {
                    return false;
                }
                candidate
            }
            BinaryOp::URem if invert_left => {
                if !want.ult(fixed) {
                    return false;
                }
                want
            }
            BinaryOp::Shl if invert_left => {
                let candidate = want.lshr(fixed);
                if candidate.shl(fixed) != want {
                    return false;
                }
                candidate
            }
            BinaryOp::LShr if invert_left => {
                let candidate = want.shl(fixed);
                if candidate.lshr(fixed) != want {
                    return false;
                }
                candidate
            }
            _ => return false,
        };
        self.force(target, value, a)
    }

    fn force_compare(
        &mut self,
        op: CompareOp,
        left: &ExprRef,
        right: &ExprRef,
        want: BitVec,
        a: &mut Assignment,
    ) -> bool {
        let want = want.is_true();
        let width = left.width();
        match op {
            CompareOp::Eq => {
                if want {
                    if left.is_constant() {
                        let v = left.as_constant().unwrap();
                        self.force(right, v, a)
                    } else {
                        let Some(v) = a.evaluate(right) else {
                            return false;
                        };
                        self.force(left, v, a)
                    }
                } else {
                    let (pivot, other) = if left.is_constant() {
                        (left.as_constant().unwrap(), right)
                    } else {
                        match a.evaluate(right) {
                            Some(v) => (v, left),
                            None => return false,
                        }
                    };
                    let delta = 1 + (self.rng.gen::<u128>() & 0xff);
                    self.force(other, pivot.add(BitVec::new(delta, width)), a)
                }
            }
            CompareOp::Ult | CompareOp::Ule => {
                let strict = op == CompareOp::Ult;
                if let Some(r) = right.as_constant() {
                    self.force_unsigned_range(left, r, strict, want, a)
                } else if let Some(l) = left.as_constant() {
                    let max = BitVec::ones(width).bits();
                    let (lo, hi) = if want {
                        // l < x wants x in (l, max]; l <= x wants [l, max].
                        let lo = l.bits() + u128::from(strict);
                        if lo > max {
                            return false;
                        }
                        (lo, max)
                    } else {
                        // not (l < x) means x <= l; not (l <= x) means x < l.
                        if !strict && l.bits() == 0 {
                            return false;
                        }
                        (0, l.bits() - u128::from(!strict))
                    };
                    self.force_in_range(right, lo, hi, !want, a)
                } else {
                    let Some(r) = a.evaluate(right) else {
                        return false;
                    };
                    self.force_unsigned_range(left, r, strict, want, a)
                }
            }
            CompareOp::Slt | CompareOp::Sle => {
                // Sample a signed-consistent value for the left side with
                // the right frozen.
                let Some(r) = (if let Some(r) = right.as_constant() {
                    Some(r)
                } else {
                    a.evaluate(right)
                }) else {
                    return false;
                };
                let strict = op == CompareOp::Slt;
                let bound = r.signed();
                let min = BitVec::new(1u128 << (width - 1), width).signed();
                let max = BitVec::new((1u128 << (width - 1)) - 1, width).signed();
                let (lo, hi) = if want {
                    (min, bound - i128::from(strict))
                } else {
                    (bound + i128::from(!strict), max)
                };
                if lo > hi {
                    return false;
                }
                let sample = self.rng.gen_range(lo..=hi);
                self.force(left, BitVec::new(sample as u128, width), a)
            }
        }
    }

    /// Forces `e` strictly or weakly below/above a concrete bound.
    fn force_unsigned_range(
        &mut self,
        e: &ExprRef,
        bound: BitVec,
        strict: bool,
        below: bool,
        a: &mut Assignment,
    ) -> bool {
        let width = e.width();
        let max = BitVec::ones(width).bits();
        let (lo, hi) = if below {
            // e < bound (strict) or e <= bound.
            let hi = bound.bits();
            if strict && hi == 0 {
                return false;
            }
            (0, hi - u128::from(strict))
        } else {
            // e >= bound (negated strict) or e > bound.
            let lo = bound.bits() + u128::from(!strict);
            if lo > max {
                return false;
            }
            (lo, max)
        };
        self.force_in_range(e, lo, hi, below, a)
    }

    fn force_in_range(
        &mut self,
        e: &ExprRef,
        lo: u128,
        hi: u128,
        prefer_low: bool,
        a: &mut Assignment,
    ) -> bool {
        if lo > hi {
            return false;
        }
        let width = e.width();
        // Try the boundary first, then random samples inside the range.
        let first = if prefer_low { lo } else { hi };
        if self.force(e, BitVec::new(first, width), a) {
            return true;
        }
        for _ in 0..4 {
            let sample = lo + self.rng.gen::<u128>() % (hi - lo + 1);
            if self.force(e, BitVec::new(sample, width), a) {
                return true;
            }
        }
        false
    }
}

fn modular_inverse(v: BitVec) -> BitVec {
    // Newton iteration over 2^k; v must be odd.
    debug_assert!(v.bits() % 2 == 1);
    let mut inverse = BitVec::new(1, v.width());
    for _ in 0..8 {
        let two = BitVec::new(2, v.width());
        inverse = inverse.mul(two.sub(v.mul(inverse)));
    }
    debug_assert!(v.mul(inverse).bits() == 1);
    inverse
}

fn footprint_arrays(set: &[ExprRef]) -> Vec<ArrayRef> {
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

/// Layer 1: false conjuncts, complement pairs, substitution refutation.
fn refute_structurally(set: &[ExprRef]) -> Option<Probe> {
    let mut members = std::collections::HashSet::new();
    for e in set {
        if e.is_false() {
            return Some(Probe::Unsat);
        }
        members.insert(Rc::as_ptr(e) as usize);
    }
    for e in set {
        if let ExprKind::Compare {
            op: CompareOp::Eq,
            left,
            right,
        } = e.kind()
        {
            if left.is_false() && members.contains(&(Rc::as_ptr(right) as usize)) {
                return Some(Probe::Unsat);
            }
        }
    }
    // Substitute every constant equality through the other conjuncts.
    let entries: Vec<(ExprRef, ExprRef)> = set
        .iter()
        .filter_map(|e| {
            if let ExprKind::Compare {
                op: CompareOp::Eq,
                left,
                right,
            } = e.kind()
            {
                if left.is_constant() && !right.is_constant() {
                    return Some((right.clone(), left.clone()));
                }
            }
            None
        })
        .collect();
    if entries.is_empty() {
        return None;
    }
    let map: HashMap<usize, ExprRef> = entries
        .iter()
        .map(|(rhs, c)| (Rc::as_ptr(rhs) as usize, c.clone()))
        .collect();
    let mut visitor = ReplaceMapVisitor::new(&map);
    let mut un_cache = UpdateNodeCache::default();
    let mut driver = RewriteDriver::new(&mut visitor, &mut un_cache);
    for e in set {
        if map.contains_key(&(Rc::as_ptr(e) as usize)) {
            continue;
        }
        let rewritten = driver.rewrite(e);
        if rewritten.is_false() {
            trace!("substitution refutes {}", e);
            return Some(Probe::Unsat);
        }
    }
    None
}

/// Layer 2: unsigned interval propagation.
#[derive(Clone, Copy, Debug)]
struct Range {
    lo: u128,
    hi: u128,
}

impl Range {
    fn full(width: Width) -> Self {
        Range {
            lo: 0,
            hi: BitVec::ones(width).bits(),
        }
    }

    fn exact(v: BitVec) -> Self {
        Range {
            lo: v.bits(),
            hi: v.bits(),
        }
    }

    fn intersect(self, other: Range) -> Option<Range> {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        if lo <= hi {
            Some(Range { lo, hi })
        } else {
            None
        }
    }
}

fn refute_by_intervals(set: &[ExprRef]) -> Option<Probe> {
    let mut bounds: HashMap<usize, Range> = HashMap::new();
    let mut keepalive = Vec::new();
    for e in set {
        if !gather_bounds(e, true, &mut bounds, &mut keepalive) {
            return Some(Probe::Unsat);
        }
    }
    if bounds.is_empty() {
        return None;
    }
    let mut memo = HashMap::new();
    for e in set {
        if truth_by_intervals(e, &bounds, &mut memo) == Some(false) {
            trace!("intervals refute {}", e);
            return Some(Probe::Unsat);
        }
    }
    None
}

fn apply_bound(
    bounds: &mut HashMap<usize, Range>,
    keepalive: &mut Vec<ExprRef>,
    target: &ExprRef,
    range: Range,
) -> bool {
    let key = Rc::as_ptr(target) as usize;
    let current = bounds
        .get(&key)
        .copied()
        .unwrap_or_else(|| Range::full(target.width()));
    match current.intersect(range) {
        Some(merged) => {
            keepalive.push(target.clone());
            bounds.insert(key, merged);
            true
        }
        None => false,
    }
}

/// Extracts range facts from a constraint assumed to have truth `polarity`.
/// Returns false on a direct contradiction.
fn gather_bounds(
    e: &ExprRef,
    polarity: bool,
    bounds: &mut HashMap<usize, Range>,
    keepalive: &mut Vec<ExprRef>,
) -> bool {
    match e.kind() {
        ExprKind::Compare { op, left, right } => {
            let width = left.width();
            let max = BitVec::ones(width).bits();
            match (op, left.as_constant(), right.as_constant()) {
                (CompareOp::Eq, Some(k), None) => {
                    if k.width() == crate::expr::BOOL && right.is_bool() {
                        // Eq(false, x): recurse with flipped polarity.
                        if k.is_false() {
                            return gather_bounds(right, !polarity, bounds, keepalive);
                        }
                        return true;
                    }
                    if polarity {
                        return apply_bound(bounds, keepalive, right, Range::exact(k));
                    }
                    true
                }
                (CompareOp::Ult, None, Some(k)) => {
                    if polarity {
                        // x < k
                        if k.bits() == 0 {
                            return false;
                        }
                        apply_bound(bounds, keepalive, left, Range { lo: 0, hi: k.bits() - 1 })
                    } else {
                        // x >= k
                        apply_bound(bounds, keepalive, left, Range { lo: k.bits(), hi: max })
                    }
                }
                (CompareOp::Ult, Some(k), None) => {
                    if polarity {
                        // k < x
                        if k.bits() == max {
                            return false;
                        }
                        apply_bound(
                            bounds,
                            keepalive,
                            right,
                            Range { lo: k.bits() + 1, hi: max },
                        )
                    } else {
                        // x <= k
                        apply_bound(bounds, keepalive, right, Range { lo: 0, hi: k.bits() })
                    }
                }
                (CompareOp::Ule, None, Some(k)) => {
                    if polarity {
                        apply_bound(bounds, keepalive, left, Range { lo: 0, hi: k.bits() })
                    } else {
                        if k.bits() == max {
                            return false;
                        }
                        apply_bound(bounds, keepalive, left, Range { lo: k.bits() + 1, hi: max })
                    }
                }
                (CompareOp::Ule, Some(k), None) => {
                    if polarity {
                        apply_bound(bounds, keepalive, right, Range { lo: k.bits(), hi: max })
                    } else {
                        if k.bits() == 0 {
                            return false;
                        }
                        apply_bound(
                            bounds,
                            keepalive,
                            right,
                            Range { lo: 0, hi: k.bits() - 1 },
                        )
                    }
                }
                _ => true,
            }
        }
        ExprKind::Binary {
            op: BinaryOp::And,
            left,
            right,
        } if e.is_bool() && polarity => {
            gather_bounds(left, true, bounds, keepalive)
                && gather_bounds(right, true, bounds, keepalive)
        }
        _ => true,
    }
}

fn interval_of(
    e: &ExprRef,
    bounds: &HashMap<usize, Range>,
    memo: &mut HashMap<usize, Range>,
) -> Range {
    let key = Rc::as_ptr(e) as usize;
    if let Some(hit) = memo.get(&key) {
        return *hit;
    }
    let width = e.width();
    let structural = match e.kind() {
        ExprKind::Constant(v) => Range::exact(*v),
        ExprKind::ZExt(inner) => interval_of(inner, bounds, memo),
        ExprKind::SExt(inner) => {
            let r = interval_of(inner, bounds, memo);
            let sign = 1u128 << (inner.width() - 1);
            if r.hi < sign {
                r
            } else {
                Range::full(width)
            }
        }
        ExprKind::Concat { left, right } => {
            let l = interval_of(left, bounds, memo);
            let r = interval_of(right, bounds, memo);
            let shift = right.width();
            Range {
                lo: (l.lo << shift) + r.lo,
                hi: (l.hi << shift) + r.hi,
            }
        }
        ExprKind::Extract { src, offset } if *offset == 0 => {
            let r = interval_of(src, bounds, memo);
            if r.hi <= BitVec::ones(width).bits() {
                r
            } else {
                Range::full(width)
            }
        }
        ExprKind::Select {
            on_true, on_false, ..
        } => {
            let t = interval_of(on_true, bounds, memo);
            let f = interval_of(on_false, bounds, memo);
            Range {
                lo: t.lo.min(f.lo),
                hi: t.hi.max(f.hi),
            }
        }
        ExprKind::Binary { op, left, right } => {
            let l = interval_of(left, bounds, memo);
            let r = interval_of(right, bounds, memo);
            let max = BitVec::ones(width).bits();
            match op {
                BinaryOp::Add if l.hi.checked_add(r.hi).map_or(false, |s| s <= max) => Range {
                    lo: l.lo + r.lo,
                    hi: l.hi + r.hi,
                },
                BinaryOp::Sub if l.lo >= r.hi => Range {
                    lo: l.lo - r.hi,
                    hi: l.hi - r.lo,
                },
                BinaryOp::Mul if l.hi.checked_mul(r.hi).map_or(false, |p| p <= max) => Range {
                    lo: l.lo * r.lo,
                    hi: l.hi * r.hi,
                },
                BinaryOp::UDiv => match right.as_constant() {
                    Some(k) if !k.is_zero() => Range {
                        lo: l.lo / k.bits(),
                        hi: l.hi / k.bits(),
                    },
                    _ => Range::full(width),
                },
                BinaryOp::And => Range {
                    lo: 0,
                    hi: l.hi.min(r.hi),
                },
                BinaryOp::LShr => match right.as_constant() {
                    Some(k) if k.bits() < u128::from(width) => Range {
                        lo: l.lo >> k.bits(),
                        hi: l.hi >> k.bits(),
                    },
                    _ => Range::full(width),
                },
                _ => Range::full(width),
            }
        }
        _ => Range::full(width),
    };
    let result = match bounds.get(&key) {
        Some(refined) => structural.intersect(*refined).unwrap_or(structural),
        None => structural,
    };
    memo.insert(key, result);
    result
}

fn truth_by_intervals(
    e: &ExprRef,
    bounds: &HashMap<usize, Range>,
    memo: &mut HashMap<usize, Range>,
) -> Option<bool> {
    match e.kind() {
        ExprKind::Constant(v) => Some(!v.is_zero()),
        ExprKind::Compare { op, left, right } => {
            if left.is_bool() && *op == CompareOp::Eq {
                if let Some(l) = left.as_constant() {
                    return truth_by_intervals(right, bounds, memo).map(|t| t == l.is_true());
                }
            }
            let l = interval_of(left, bounds, memo);
            let r = interval_of(right, bounds, memo);
            match op {
                CompareOp::Ult => {
                    if l.hi < r.lo {
                        Some(true)
                    } else if l.lo >= r.hi {
                        Some(false)
                    } else {
                        None
                    }
                }
                CompareOp::Ule => {
                    if l.hi <= r.lo {
                        Some(true)
                    } else if l.lo > r.hi {
                        Some(false)
                    } else {
                        None
                    }
                }
                CompareOp::Eq => {
                    if l.lo == l.hi && r.lo == r.hi && l.lo == r.lo {
                        Some(true)
                    } else if l.hi < r.lo || r.hi < l.lo {
                        Some(false)
                    } else {
                        None
                    }
                }
                CompareOp::Slt | CompareOp::Sle => None,
            }
        }
        ExprKind::Binary {
            op: BinaryOp::And,
            left,
            right,
        } if e.is_bool() => {
            match (
                truth_by_intervals(left, bounds, memo),
                truth_by_intervals(right, bounds, memo),
            ) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            }
        }
        _ => None,
    }
}

impl SolverImpl for SearchSolver {
    fn name(&self) -> &'static str {
        "search"
    }

    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        // A constraint entails itself.
        if query
            .constraints
            .iter()
            .any(|c| Rc::ptr_eq(c, &query.expr))
        {
            return Ok(true);
        }
        let mut set: Vec<ExprRef> = query.constraints.to_vec();
        set.push(Expr::logical_not(query.expr.clone()));
        match self.probe(&set) {
            Probe::Unsat => Ok(true),
            Probe::Sat(_) => Ok(false),
            Probe::Unknown => Err(SolverError::Timeout),
        }
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<BitVec> {
        match self.probe(query.constraints) {
            Probe::Sat(mut a) => {
                a.default_zero = true;
                a.evaluate(&query.expr)
                    .ok_or_else(|| SolverError::Backend("unevaluable value query".into()))
            }
            Probe::Unsat => Err(SolverError::Backend(
                "value query over an infeasible path".into(),
            )),
            Probe::Unknown => Err(SolverError::Timeout),
        }
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayRef],
    ) -> SolverResult<Option<Assignment>> {
        let mut set: Vec<ExprRef> = query.constraints.to_vec();
        if !query.expr.is_false() {
            set.push(Expr::logical_not(query.expr.clone()));
        }
        match self.probe(&set) {
            Probe::Sat(mut assignment) => {
                for array in arrays {
                    if assignment.bytes_for(array).is_none() {
                        assignment.bind(array, vec![0; array.size() as usize]);
                    }
                }
                Ok(Some(assignment))
            }
            Probe::Unsat => Ok(None),
            Probe::Unknown => Err(SolverError::Timeout),
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::super::Validity;
    use super::*;
    use crate::expr::{ExprContext, UpdateList, INT32};

    fn word32(name: &str) -> (ArrayRef, ExprRef) {
        let a = ExprContext::with(|cx| cx.arrays.symbolic(name, 4));
        let byte = |i: u64| {
            Expr::read(
                UpdateList::new(a.clone(), None),
                Expr::constant_u64(i, INT32),
            )
        };
        let word = Expr::concat(
            byte(3),
            Expr::concat(byte(2), Expr::concat(byte(1), byte(0))),
        );
        (a, word)
    }

    #[test]
    fn finds_model_for_upper_bound() {
        let (_a, x) = word32("ss_ub");
        let mut solver = SearchSolver::new(512);
        let constraints = vec![Expr::ult(x.clone(), Expr::constant_u64(10, INT32))];
        let q = Query::new(&constraints, Expr::bool_const(false));
        let a = solver
            .compute_initial_values(&q, &[])
            .unwrap()
            .expect("satisfiable");
        assert!(a.evaluate(&x).unwrap().as_u64() < 10);
    }

    #[test]
    fn finds_model_for_lower_bound() {
        let (_a, x) = word32("ss_lb");
        let mut solver = SearchSolver::new(512);
        let constraints = vec![Expr::logical_not(Expr::ult(
            x.clone(),
            Expr::constant_u64(10, INT32),
        ))];
        let q = Query::new(&constraints, Expr::bool_const(false));
        let a = solver
            .compute_initial_values(&q, &[])
            .unwrap()
            .expect("satisfiable");
        assert!(a.evaluate(&x).unwrap().as_u64() >= 10);
    }

    #[test]
    fn entailment_across_widths() {
        let (_a, x) = word32("ss_ent");
        // (x < 16) entails (zext(x) < 16) even though the widths differ.
        let constraints = vec![Expr::ult(x.clone(), Expr::constant_u64(16, INT32))];
        let wide = Expr::ult(
            Expr::zext(x.clone(), 64),
            Expr::constant_u64(16, 64),
        );
        let mut solver = SearchSolver::new(512);
        let q = Query::new(&constraints, wide);
        assert!(solver.compute_truth(&q).unwrap());
    }

    #[test]
    fn refutes_contradicted_equality() {
        let (_a, x) = word32("ss_ref");
        let target = Expr::constant_u64(0x44332211, INT32);
        let constraints = vec![Expr::logical_not(Expr::eq(target.clone(), x.clone()))];
        let mut solver = SearchSolver::new(512);
        // may x == target? No: its negation is a constraint.
        let q = Query::new(&constraints, Expr::eq(target, x));
        let value = solver.compute_validity(&q).unwrap();
        assert_eq!(value, Validity::False);
    }

    #[test]
    fn tiny_footprints_enumerate_to_unsat() {
        let a = ExprContext::with(|cx| cx.arrays.symbolic("ss_enum", 1));
        let b = Expr::read(
            UpdateList::new(a.clone(), None),
            Expr::constant_u64(0, INT32),
        );
        // b * b == 3 has no solution modulo 256.
        let sq = Expr::mul(Expr::zext(b.clone(), INT32), Expr::zext(b, INT32));
        let constraints = vec![Expr::eq(Expr::constant_u64(3, INT32), sq)];
        let mut solver = SearchSolver::new(512);
        let q = Query::new(&constraints, Expr::bool_const(false));
        assert!(solver.compute_initial_values(&q, &[]).unwrap().is_none());
    }

    #[test]
    fn wide_nonlinear_queries_time_out() {
        let (_a, x) = word32("ss_hard");
        let sq = Expr::mul(x.clone(), x.clone());
        // x * x == 99 is unsatisfiable modulo 2^32 but out of reach for
        // the word-level layers.
        let constraints = vec![Expr::eq(Expr::constant_u64(99, INT32), sq)];
        let mut solver = SearchSolver::new(128);
        let q = Query::new(&constraints, Expr::bool_const(false));
        assert!(matches!(
            solver.compute_initial_values(&q, &[]),
            Err(SolverError::Timeout)
        ));
    }
}
