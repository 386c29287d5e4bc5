//! The per-path constraint store.
//!
//! Holds the ordered conjunction of path constraints, the equalities map
//! used for expression simplification, and the partition of the set into
//! independent factors. Adding an `Eq(const, x)` constraint substitutes
//! `x -> const` across the existing set until a fixed point; adding `And`
//! splits the conjuncts for finer-grained independence.

pub mod independent;

pub use independent::IndependentSet;

use crate::expr::visitor::{
    Action, ExprRewriter, ReplaceMapVisitor, RewriteDriver, UpdateNodeCache,
};
use crate::expr::{CompareCacheGuard, CompareOp, Expr, ExprKind, ExprRef};
use log::{trace, warn};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

#[derive(Clone, Copy, Debug)]
pub struct ConstraintConfig {
    /// Enables the `Eq(const, x)` rewrite of existing constraints.
    pub rewrite_equalities: bool,
    /// Enables equality substitution when simplifying expressions.
    pub equality_substitution: bool,
    /// Maintains the independent-set partition.
    pub use_independent: bool,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            rewrite_equalities: true,
            equality_substitution: true,
            use_independent: true,
        }
    }
}

/// If the constraint is a rewritable equality, its `(rhs, const)` pair.
/// The guard against `Eq` on the right-hand side keeps boolean negations
/// from looping through the substitution.
fn as_equality(e: &ExprRef) -> Option<(ExprRef, ExprRef)> {
    if let ExprKind::Compare {
        op: CompareOp::Eq,
        left,
        right,
    } = e.kind()
    {
        if left.is_constant()
            && !matches!(
                right.kind(),
                ExprKind::Compare {
                    op: CompareOp::Eq,
                    ..
                }
            )
        {
            return Some((right.clone(), left.clone()));
        }
    }
    None
}

/// Map-based substitution that leaves one designated node alone, so an
/// equality never rewrites itself to `true` during its own pass.
struct ReplaceExceptVisitor<'m> {
    map: &'m HashMap<usize, ExprRef>,
    skip: Option<usize>,
}

impl ExprRewriter for ReplaceExceptVisitor<'_> {
    fn visit(&mut self, e: &ExprRef) -> Action {
        let key = Rc::as_ptr(e) as usize;
        if Some(key) == self.skip {
            return Action::SkipChildren;
        }
        match self.map.get(&key) {
            Some(r) => Action::ChangeTo(r.clone()),
            None => Action::DoChildren,
        }
    }
}

#[derive(Clone)]
pub struct ConstraintManager {
    constraints: Vec<ExprRef>,
    members: HashSet<usize>,
    /// rhs -> (rhs, const) for rewritable equalities; whole constraints map
    /// to true so simplification can fold known facts.
    equalities: HashMap<usize, (ExprRef, ExprRef)>,
    factors: Vec<IndependentSet>,
    shared_un: UpdateNodeCache,
    config: ConstraintConfig,
}

impl ConstraintManager {
    pub fn new(config: ConstraintConfig) -> Self {
        Self {
            constraints: Vec::new(),
            members: HashSet::new(),
            equalities: HashMap::new(),
            factors: Vec::new(),
            shared_un: UpdateNodeCache::default(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Iteration preserves insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, ExprRef> {
        self.constraints.iter()
    }

    pub fn constraints(&self) -> &[ExprRef] {
        &self.constraints
    }

    pub fn factors(&self) -> &[IndependentSet] {
        &self.factors
    }

    pub fn contains(&self, e: &ExprRef) -> bool {
        self.members.contains(&(Rc::as_ptr(e) as usize))
    }

    /// Applies the equalities map to an expression.
    pub fn simplify(&self, e: &ExprRef) -> ExprRef {
        if !self.config.equality_substitution || e.is_constant() || self.equalities.is_empty() {
            return e.clone();
        }
        let map: HashMap<usize, ExprRef> = self
            .equalities
            .iter()
            .map(|(&k, (_, c))| (k, c.clone()))
            .collect();
        let mut visitor = ReplaceMapVisitor::new(&map);
        let mut shared = self.shared_un.clone();
        RewriteDriver::new(&mut visitor, &mut shared).rewrite(e)
    }

    /// Adds a constraint; returns false when the set became inconsistent
    /// (the constraint or a rewrite of the set folded to false).
    pub fn add(&mut self, e: ExprRef) -> bool {
        debug_assert!(e.is_bool());
        let _bracket = CompareCacheGuard::new();
        let simplified = self.simplify(&e);
        if simplified.is_false() {
            return false;
        }
        let mut added = Vec::new();
        let mut deleted = Vec::new();
        if !self.split_insert(simplified, &mut added) {
            return false;
        }
        if self.config.rewrite_equalities && !self.rewrite_to_fixed_point(&mut added, &mut deleted)
        {
            return false;
        }
        self.rebuild_equalities();
        if self.config.use_independent {
            self.update_partition(&added, &deleted);
        }
        true
    }

    /// Dedups, splits conjunctions, rejects false, ignores true.
    fn split_insert(&mut self, e: ExprRef, added: &mut Vec<ExprRef>) -> bool {
        if let Some(v) = e.as_constant() {
            return !v.is_false();
        }
        if self.members.contains(&(Rc::as_ptr(&e) as usize)) {
            return true;
        }
        if let ExprKind::Binary {
            op: crate::expr::BinaryOp::And,
            left,
            right,
        } = e.kind()
        {
            if e.is_bool() {
                let (l, r) = (left.clone(), right.clone());
                return self.split_insert(l, added) && self.split_insert(r, added);
            }
        }
        trace!("constraint: {}", e);
        self.members.insert(Rc::as_ptr(&e) as usize);
        self.constraints.push(e.clone());
        added.push(e);
        true
    }

    /// Substitutes every rewritable equality across the set, re-running
    /// while a pass changes anything. Each substituted occurrence strictly
    /// shrinks, so the loop terminates.
    fn rewrite_to_fixed_point(
        &mut self,
        added: &mut Vec<ExprRef>,
        deleted: &mut Vec<ExprRef>,
    ) -> bool {
        loop {
            // The entries vector keeps every rhs alive for the duration of
            // the pass; the map keys are raw pointers into it.
            let entries: Vec<(ExprRef, ExprRef)> =
                self.constraints.iter().filter_map(as_equality).collect();
            let map: HashMap<usize, ExprRef> = entries
                .iter()
                .map(|(rhs, c)| (Rc::as_ptr(rhs) as usize, c.clone()))
                .collect();
            if map.is_empty() {
                return true;
            }
            let olds = std::mem::take(&mut self.constraints);
            self.members.clear();
            let mut changed = false;
            for c in olds {
                let skip = as_equality(&c).map(|(rhs, _)| Rc::as_ptr(&rhs) as usize);
                let rewritten = {
                    let mut visitor = ReplaceExceptVisitor { map: &map, skip };
                    RewriteDriver::new(&mut visitor, &mut self.shared_un).rewrite(&c)
                };
                if Rc::ptr_eq(&rewritten, &c) {
                    self.members.insert(Rc::as_ptr(&c) as usize);
                    self.constraints.push(c);
                    continue;
                }
                changed = true;
                trace!("rewrite: {} => {}", c, rewritten);
                if let Some(pos) = added.iter().position(|a| Rc::ptr_eq(a, &c)) {
                    added.swap_remove(pos);
                } else {
                    deleted.push(c);
                }
                if rewritten.is_false() {
                    warn!("constraint set became inconsistent under rewriting");
                    return false;
                }
                if !self.split_insert(rewritten, added) {
                    return false;
                }
            }
            if !changed {
                return true;
            }
        }
    }

    fn rebuild_equalities(&mut self) {
        self.equalities.clear();
        for c in &self.constraints {
            if let Some((rhs, constant)) = as_equality(c) {
                self.equalities
                    .insert(Rc::as_ptr(&rhs) as usize, (rhs, constant));
            } else {
                self.equalities.insert(
                    Rc::as_ptr(c) as usize,
                    (c.clone(), Expr::bool_const(true)),
                );
            }
        }
    }

    fn update_partition(&mut self, added: &[ExprRef], deleted: &[ExprRef]) {
        if !deleted.is_empty() {
            // Factors that lost a member are re-partitioned from their
            // surviving constraints.
            let gone: HashSet<usize> = deleted.iter().map(|e| Rc::as_ptr(e) as usize).collect();
            let (dirty, clean): (Vec<IndependentSet>, Vec<IndependentSet>) =
                std::mem::take(&mut self.factors).into_iter().partition(|f| {
                    f.exprs
                        .iter()
                        .any(|e| gone.contains(&(Rc::as_ptr(e) as usize)))
                });
            self.factors = clean;
            for factor in dirty {
                for e in factor.exprs {
                    if !gone.contains(&(Rc::as_ptr(&e) as usize)) {
                        self.merge_into_partition(IndependentSet::new(e));
                    }
                }
            }
        }
        for e in added {
            self.merge_into_partition(IndependentSet::new(e.clone()));
        }
        debug_assert_eq!(
            self.factors.iter().map(|f| f.exprs.len()).sum::<usize>(),
            self.constraints.len()
        );
    }

    fn merge_into_partition(&mut self, mut current: IndependentSet) {
        let mut remaining = Vec::with_capacity(self.factors.len());
        for factor in std::mem::take(&mut self.factors) {
            if current.intersects(&factor) {
                current.merge(&factor);
            } else {
                remaining.push(factor);
            }
        }
        remaining.push(current);
        self.factors = remaining;
    }
}

impl Default for ConstraintManager {
    fn default() -> Self {
        Self::new(ConstraintConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ArrayRef, Assignment, ExprContext, UpdateList, INT32};
    use rand::prelude::*;

    fn array(name: &str, size: u32) -> ArrayRef {
        ExprContext::with(|cx| cx.arrays.symbolic(name, size))
    }

    fn byte(a: &ArrayRef, i: u64) -> ExprRef {
        Expr::read(UpdateList::new(a.clone(), None), Expr::constant_u64(i, INT32))
    }

    fn word(a: &ArrayRef, i: u64) -> ExprRef {
        Expr::concat(byte(a, i + 1), byte(a, i))
    }

    #[test]
    fn duplicate_constraints_are_no_ops() {
        let a = array("cm_dup", 4);
        let mut cm = ConstraintManager::default();
        let c = Expr::ult(word(&a, 0), Expr::constant_u64(100, 16));
        assert!(cm.add(c.clone()));
        assert_eq!(cm.len(), 1);
        assert_eq!(cm.factors().len(), 1);
        assert!(cm.add(c));
        assert_eq!(cm.len(), 1);
        assert_eq!(cm.factors().len(), 1);
    }

    #[test]
    fn and_constraints_split_into_conjuncts() {
        let a = array("cm_and", 4);
        let c1 = Expr::ult(byte(&a, 0), byte(&a, 1));
        let c2 = Expr::ult(byte(&a, 2), byte(&a, 3));
        let mut cm = ConstraintManager::default();
        assert!(cm.add(Expr::and(c1.clone(), c2.clone())));
        assert_eq!(cm.len(), 2);
        // Disjoint bytes land in separate factors.
        assert_eq!(cm.factors().len(), 2);
    }

    #[test]
    fn adding_false_fails() {
        let mut cm = ConstraintManager::default();
        assert!(!cm.add(Expr::bool_const(false)));
    }

    #[test]
    fn equality_substitution_reaches_fixed_point() {
        let a = array("cm_subst", 8);
        let x = word(&a, 0);
        let mut cm = ConstraintManager::default();
        assert!(cm.add(Expr::ult(x.clone(), Expr::constant_u64(1000, 16))));
        assert!(cm.add(Expr::eq(Expr::constant_u64(5, 16), x.clone())));

        // No remaining constraint mentions x outside the equality itself.
        for c in cm.iter() {
            match as_equality(c) {
                Some(_) => {}
                None => assert!(
                    c.is_constant() || !mentions(c, &x),
                    "constraint still mentions substituted expr: {}",
                    c
                ),
            }
        }
        // The original strict bound folded away entirely.
        assert_eq!(cm.len(), 1);
    }

    #[test]
    fn not_optimized_shields_occurrences() {
        let a = array("cm_shield", 8);
        let x = word(&a, 0);
        let shielded = Expr::eq(
            Expr::constant_u64(7, 16),
            Expr::binary(
                crate::expr::BinaryOp::Xor,
                Expr::not_optimized(x.clone()),
                Expr::constant_u64(2, 16),
            ),
        );
        let mut cm = ConstraintManager::default();
        assert!(cm.add(shielded));
        assert!(cm.add(Expr::eq(Expr::constant_u64(5, 16), x.clone())));
        // x survives inside the opaque wrapper instead of being folded
        // through it.
        assert_eq!(cm.len(), 2);
        assert!(cm.iter().any(|c| mentions_deep(c, &x)));
    }

    #[test]
    fn rewrite_preserves_models() {
        let mut rng = StdRng::seed_from_u64(41);
        let a = array("cm_model", 4);
        for round in 0..20 {
            let x = word(&a, 0);
            let y = word(&a, 2);
            let k = rng.gen_range(0..200u64);
            let mut plain = ConstraintManager::new(ConstraintConfig {
                rewrite_equalities: false,
                equality_substitution: false,
                use_independent: false,
            });
            let mut rewriting = ConstraintManager::default();
            let cs = vec![
                Expr::ult(x.clone(), Expr::constant_u64(k + 1, 16)),
                Expr::eq(Expr::constant_u64(k, 16), x.clone()),
                Expr::ule(y.clone(), Expr::add(x.clone(), x.clone())),
            ];
            let mut ok_plain = true;
            let mut ok_rewriting = true;
            for c in &cs {
                ok_plain &= plain.add(c.clone());
                ok_rewriting &= rewriting.add(c.clone());
            }
            assert_eq!(ok_plain, ok_rewriting, "round {}", round);
            if !ok_plain {
                continue;
            }
            // Any assignment satisfies both sets or neither.
            for _ in 0..40 {
                let mut assignment = Assignment::new(true);
                assignment.bind(&a, (0..4).map(|_| rng.gen()).collect());
                assert_eq!(
                    assignment.satisfies(plain.iter()),
                    assignment.satisfies(rewriting.iter()),
                    "round {}",
                    round
                );
            }
        }
    }

    #[test]
    fn partition_factors_have_disjoint_footprints() {
        let a = array("cm_part_a", 8);
        let b = array("cm_part_b", 8);
        let mut cm = ConstraintManager::default();
        assert!(cm.add(Expr::ult(byte(&a, 0), byte(&a, 1))));
        assert!(cm.add(Expr::ult(byte(&b, 0), byte(&b, 1))));
        assert!(cm.add(Expr::ult(byte(&a, 2), byte(&a, 0))));
        assert_eq!(cm.factors().len(), 2);
        for (i, f) in cm.factors().iter().enumerate() {
            for g in cm.factors().iter().skip(i + 1) {
                assert!(!f.intersects(g));
            }
        }
        // A bridging constraint collapses the factors into one.
        assert!(cm.add(Expr::ult(byte(&a, 0), byte(&b, 0))));
        assert_eq!(cm.factors().len(), 1);
    }

    fn mentions(e: &ExprRef, target: &ExprRef) -> bool {
        if Rc::ptr_eq(e, target) {
            return true;
        }
        if matches!(e.kind(), ExprKind::NotOptimized(_)) {
            return false;
        }
        let mut kids = e.kids();
        if let ExprKind::Read { updates, .. } = e.kind() {
            for node in updates.iter() {
                kids.push(node.index.clone());
                kids.push(node.value.clone());
            }
        }
        kids.iter().any(|k| mentions(k, target))
    }

    /// Like `mentions`, but looks through the opaque wrapper too.
    fn mentions_deep(e: &ExprRef, target: &ExprRef) -> bool {
        if Rc::ptr_eq(e, target) {
            return true;
        }
        e.kids().iter().any(|k| mentions_deep(k, target))
    }

    #[test]
    fn simplify_applies_known_equalities() {
        let a = array("cm_simpl", 8);
        let x = word(&a, 0);
        let mut cm = ConstraintManager::default();
        assert!(cm.add(Expr::eq(Expr::constant_u64(3, 16), x.clone())));
        let simplified = cm.simplify(&Expr::add(x, Expr::constant_u64(4, 16)));
        assert_eq!(simplified.as_constant().map(|v| v.as_u64()), Some(7));
    }

}
