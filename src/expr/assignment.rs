//! Concrete valuations of symbolic arrays and the evaluator over them.
//!
//! An assignment binds whole byte vectors to arrays. Evaluation is the
//! concrete-evaluator half of the solver stack: the counterexample cache
//! answers queries with it, the independent solver asserts its composed
//! witnesses with it, and the native back-end scores candidate assignments
//! with it.

use super::{Array, ArrayRef, BitVec, ExprKind, ExprRef};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Clone, Default)]
pub struct Assignment {
    bindings: HashMap<u64, (ArrayRef, Vec<u8>)>,
    /// When set, bytes of unbound arrays evaluate to zero instead of
    /// poisoning the result.
    pub default_zero: bool,
}

impl Assignment {
    pub fn new(default_zero: bool) -> Self {
        Self {
            bindings: HashMap::new(),
            default_zero,
        }
    }

    pub fn bind(&mut self, array: &ArrayRef, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), array.size() as usize);
        self.bindings.insert(array.id(), (array.clone(), bytes));
    }

    pub fn bytes_for(&self, array: &Array) -> Option<&[u8]> {
        self.bindings.get(&array.id()).map(|(_, b)| b.as_slice())
    }

    pub fn bytes_for_mut(&mut self, array: &ArrayRef) -> &mut Vec<u8> {
        &mut self
            .bindings
            .entry(array.id())
            .or_insert_with(|| (array.clone(), vec![0; array.size() as usize]))
            .1
    }

    pub fn arrays(&self) -> impl Iterator<Item = (&ArrayRef, &[u8])> {
        self.bindings.values().map(|(a, b)| (a, b.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Evaluates an expression to a concrete value, or `None` if it depends
    /// on an unbound array byte and `default_zero` is off.
    pub fn evaluate(&self, e: &ExprRef) -> Option<BitVec> {
        let mut cache = HashMap::new();
        self.eval(e, &mut cache)
    }

    pub fn evaluate_bool(&self, e: &ExprRef) -> Option<bool> {
        self.evaluate(e).map(|v| !v.is_zero())
    }

    /// True iff every constraint evaluates to true.
    pub fn satisfies<'c>(&self, constraints: impl IntoIterator<Item = &'c ExprRef>) -> Option<bool> {
        let mut cache = HashMap::new();
        for c in constraints {
            match self.eval(c, &mut cache) {
                Some(v) if !v.is_zero() => {}
                Some(_) => return Some(false),
                None => return None,
            }
        }
        Some(true)
    }

    fn eval(&self, e: &ExprRef, cache: &mut HashMap<usize, Option<BitVec>>) -> Option<BitVec> {
        let key = Rc::as_ptr(e) as usize;
        if let Some(hit) = cache.get(&key) {
            return *hit;
        }
        let result = self.eval_uncached(e, cache);
        cache.insert(key, result);
        result
    }

    fn eval_uncached(
        &self,
        e: &ExprRef,
        cache: &mut HashMap<usize, Option<BitVec>>,
    ) -> Option<BitVec> {
        match e.kind() {
            ExprKind::Constant(v) => Some(*v),
            ExprKind::NotOptimized(inner) => self.eval(inner, cache),
            ExprKind::Read { updates, index } => {
                let idx = self.eval(index, cache)?;
                for node in updates.iter() {
                    let ui = self.eval(&node.index, cache)?;
                    if ui == idx {
                        return self.eval(&node.value, cache);
                    }
                }
                let array = updates.root();
                if let Some(v) = array.constant_at(idx.as_u64()) {
                    return Some(v);
                }
                if idx.as_u64() >= u64::from(array.size()) {
                    // Out-of-range symbolic read; unconstrained.
                    return if self.default_zero {
                        Some(BitVec::zero(array.range()))
                    } else {
                        None
                    };
                }
                match self.bytes_for(array) {
                    Some(bytes) => Some(BitVec::new(
                        u128::from(bytes[idx.as_u64() as usize]),
                        array.range(),
                    )),
                    None if self.default_zero => Some(BitVec::zero(array.range())),
                    None => None,
                }
            }
            ExprKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                let c = self.eval(cond, cache)?;
                if c.is_zero() {
                    self.eval(on_false, cache)
                } else {
                    self.eval(on_true, cache)
                }
            }
            ExprKind::Concat { left, right } => {
                let l = self.eval(left, cache)?;
                let r = self.eval(right, cache)?;
                Some(l.concat(r))
            }
            ExprKind::Extract { src, offset } => {
                let v = self.eval(src, cache)?;
                Some(v.extract(*offset, e.width()))
            }
            ExprKind::ZExt(src) => Some(self.eval(src, cache)?.zext(e.width())),
            ExprKind::SExt(src) => Some(self.eval(src, cache)?.sext(e.width())),
            ExprKind::Not(src) => Some(self.eval(src, cache)?.not()),
            ExprKind::Binary { op, left, right } => {
                let l = self.eval(left, cache)?;
                let r = self.eval(right, cache)?;
                Some(op.apply(l, r))
            }
            ExprKind::Compare { op, left, right } => {
                let l = self.eval(left, cache)?;
                let r = self.eval(right, cache)?;
                Some(BitVec::bool(op.apply(l, r)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, ExprContext, UpdateList, INT32};

    #[test]
    fn reads_respect_updates_and_bytes() {
        let a = ExprContext::with(|cx| cx.arrays.symbolic("atest", 4));
        let mut ul = UpdateList::new(a.clone(), None);

        let mut assignment = Assignment::new(false);
        assignment.bind(&a, vec![10, 20, 30, 40]);

        let plain = Expr::read(ul.clone(), Expr::constant_u64(2, INT32));
        assert_eq!(assignment.evaluate(&plain).map(|v| v.as_u64()), Some(30));

        ul.extend(
            Expr::constant_u64(2, INT32),
            Expr::constant_u64(99, crate::expr::INT8),
        );
        let symbolic_index = Expr::read(
            ul,
            Expr::zext(
                Expr::read(
                    UpdateList::new(a.clone(), None),
                    Expr::constant_u64(0, INT32),
                ),
                INT32,
            ),
        );
        // byte 0 holds 10, which misses the update at 2 and lands out of
        // range, so the read is unconstrained.
        assert_eq!(assignment.evaluate(&symbolic_index), None);

        let mut zeroed = assignment.clone();
        zeroed.default_zero = true;
        assert_eq!(
            zeroed.evaluate(&symbolic_index).map(|v| v.as_u64()),
            Some(0)
        );
    }
}
