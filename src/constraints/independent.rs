//! Access footprints and independent element sets.
//!
//! Two constraints are independent when they share no symbolic array
//! element: neither a whole array (accessed through a symbolic index) nor
//! an overlapping set of concrete byte indices. The constraint manager
//! partitions its set into maximal groups of dependent constraints and the
//! independent solver layer decomposes queries along the same footprints.

use crate::expr::{ArrayRef, ExprKind, ExprRef};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// One or more constraints plus the union of their footprints.
#[derive(Clone, Default)]
pub struct IndependentSet {
    pub exprs: Vec<ExprRef>,
    /// Arrays reached through a symbolic index, keyed by array id.
    whole: HashMap<u64, ArrayRef>,
    /// Concrete byte indices per array, for arrays not in `whole`.
    elements: HashMap<u64, (ArrayRef, HashSet<u32>)>,
}

impl IndependentSet {
    pub fn new(e: ExprRef) -> Self {
        let mut set = IndependentSet::default();
        let mut seen = HashSet::new();
        set.collect(&e, &mut seen);
        set.exprs.push(e);
        set
    }

    /// Footprint of an expression without membership.
    pub fn footprint_of(e: &ExprRef) -> Self {
        let mut set = IndependentSet::default();
        let mut seen = HashSet::new();
        set.collect(e, &mut seen);
        set
    }

    fn collect(&mut self, e: &ExprRef, seen: &mut HashSet<usize>) {
        if !seen.insert(Rc::as_ptr(e) as usize) {
            return;
        }
        if let ExprKind::Read { updates, index } = e.kind() {
            let array = updates.root();
            // Constant arrays without updates are pure data, not unknowns.
            let pure_constant = array.is_constant() && updates.is_empty();
            let mut symbolic_access = !index.is_constant();
            for node in updates.iter() {
                if !node.index.is_constant() {
                    symbolic_access = true;
                }
                self.collect(&node.index, seen);
                self.collect(&node.value, seen);
            }
            self.collect(index, seen);
            if !pure_constant {
                if symbolic_access {
                    self.add_whole(array.clone());
                } else if let Some(i) = index.as_constant() {
                    self.add_element(array.clone(), i.as_u64() as u32);
                }
            }
            return;
        }
        for kid in e.kids() {
            self.collect(&kid, seen);
        }
    }

    fn add_whole(&mut self, array: ArrayRef) {
        let id = array.id();
        self.elements.remove(&id);
        self.whole.insert(id, array);
    }

    fn add_element(&mut self, array: ArrayRef, index: u32) {
        let id = array.id();
        if self.whole.contains_key(&id) {
            return;
        }
        self.elements
            .entry(id)
            .or_insert_with(|| (array, HashSet::new()))
            .1
            .insert(index);
    }

    /// Footprints intersect iff they share a whole array, a whole array on
    /// one side meets any access on the other, or byte sets overlap.
    pub fn intersects(&self, other: &IndependentSet) -> bool {
        for id in self.whole.keys() {
            if other.whole.contains_key(id) || other.elements.contains_key(id) {
                return true;
            }
        }
        for (id, (_, indices)) in &self.elements {
            if other.whole.contains_key(id) {
                return true;
            }
            if let Some((_, other_indices)) = other.elements.get(id) {
                if indices.iter().any(|i| other_indices.contains(i)) {
                    return true;
                }
            }
        }
        false
    }

    /// Unions the other set's expressions and footprints into this one.
    pub fn merge(&mut self, other: &IndependentSet) {
        self.exprs.extend(other.exprs.iter().cloned());
        for array in other.whole.values() {
            self.add_whole(array.clone());
        }
        for (array, indices) in other.elements.values() {
            for &i in indices {
                self.add_element(array.clone(), i);
            }
        }
    }

    /// Every array the footprint references, in deterministic id order.
    pub fn arrays(&self) -> Vec<ArrayRef> {
        let mut result: Vec<ArrayRef> = self
            .whole
            .values()
            .chain(self.elements.values().map(|(a, _)| a))
            .cloned()
            .collect();
        result.sort_by_key(|a| a.id());
        result.dedup_by_key(|a| a.id());
        result
    }

    pub fn contains_whole(&self, array: &ArrayRef) -> bool {
        self.whole.contains_key(&array.id())
    }

    /// Concrete byte indices of one array, if it is tracked per-element.
    pub fn element_indices(&self, array: &ArrayRef) -> Option<&HashSet<u32>> {
        self.elements.get(&array.id()).map(|(_, s)| s)
    }

    pub fn is_disjoint_footprint(&self) -> bool {
        self.whole.is_empty() && self.elements.is_empty()
    }
}

impl fmt::Display for IndependentSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{exprs: {}", self.exprs.len())?;
        if !self.whole.is_empty() {
            write!(f, ", whole:")?;
            for a in self.whole.values() {
                write!(f, " {}", a)?;
            }
        }
        if !self.elements.is_empty() {
            write!(f, ", bytes:")?;
            for (a, s) in self.elements.values() {
                write!(f, " {}x{}", a, s.len())?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, ExprContext, UpdateList, INT32};

    fn read(a: &ArrayRef, i: u64) -> ExprRef {
        Expr::read(UpdateList::new(a.clone(), None), Expr::constant_u64(i, INT32))
    }

    #[test]
    fn byte_footprints_intersect_only_on_overlap() {
        let a = ExprContext::with(|cx| cx.arrays.symbolic("ind_a", 8));
        let b = ExprContext::with(|cx| cx.arrays.symbolic("ind_b", 8));

        let c0 = IndependentSet::new(Expr::ult(read(&a, 0), read(&a, 1)));
        let c1 = IndependentSet::new(Expr::ult(read(&a, 1), read(&a, 2)));
        let c2 = IndependentSet::new(Expr::ult(read(&a, 4), read(&b, 0)));

        assert!(c0.intersects(&c1));
        assert!(!c0.intersects(&c2));
        assert!(!c1.intersects(&c2));
    }

    #[test]
    fn symbolic_index_claims_the_whole_array() {
        let a = ExprContext::with(|cx| cx.arrays.symbolic("ind_w", 8));
        let sym_index = Expr::zext(read(&a, 7), INT32);
        let whole = IndependentSet::new(Expr::eq(
            Expr::constant_u64(1, crate::expr::INT8),
            Expr::read(UpdateList::new(a.clone(), None), sym_index),
        ));
        assert!(whole.contains_whole(&a));

        let byte = IndependentSet::new(Expr::eq(
            Expr::constant_u64(2, crate::expr::INT8),
            read(&a, 3),
        ));
        assert!(whole.intersects(&byte));
    }
}
