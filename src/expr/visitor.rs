//! Rewriting visitors over the expression DAG.
//!
//! A driver walks the DAG once per pass, memoizing rewritten nodes in a
//! per-pass cache and deduplicating rewritten update chains through a
//! manager-level cache, so shared sub-DAGs rewrite once. `NotOptimized`
//! nodes block descent.

use super::{Expr, ExprKind, ExprRef, UpdateList, UpdateNode, UpdateNodeRef};
use std::collections::HashMap;
use std::rc::Rc;

pub enum Action {
    DoChildren,
    SkipChildren,
    ChangeTo(ExprRef),
}

pub trait ExprRewriter {
    fn visit(&mut self, e: &ExprRef) -> Action;
}

/// Manager-level deduplication of rewritten update nodes, keyed on content.
/// Lives as long as its constraint manager; per-pass caches do not.
#[derive(Default, Clone)]
pub struct UpdateNodeCache {
    buckets: HashMap<u32, Vec<UpdateNodeRef>>,
}

impl UpdateNodeCache {
    fn dedup(&mut self, node: UpdateNodeRef) -> UpdateNodeRef {
        let bucket = self.buckets.entry(node.hash()).or_default();
        for existing in bucket.iter() {
            let same_next = match (&existing.next, &node.next) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            };
            if same_next
                && Rc::ptr_eq(&existing.index, &node.index)
                && Rc::ptr_eq(&existing.value, &node.value)
            {
                return existing.clone();
            }
        }
        bucket.push(node.clone());
        node
    }
}

pub struct RewriteDriver<'a, V: ExprRewriter> {
    visitor: &'a mut V,
    visited: HashMap<usize, ExprRef>,
    visited_un: HashMap<usize, UpdateNodeRef>,
    shared_un: &'a mut UpdateNodeCache,
}

impl<'a, V: ExprRewriter> RewriteDriver<'a, V> {
    pub fn new(visitor: &'a mut V, shared_un: &'a mut UpdateNodeCache) -> Self {
        Self {
            visitor,
            visited: HashMap::new(),
            visited_un: HashMap::new(),
            shared_un,
        }
    }

    pub fn rewrite(&mut self, e: &ExprRef) -> ExprRef {
        let key = Rc::as_ptr(e) as usize;
        if let Some(done) = self.visited.get(&key) {
            return done.clone();
        }
        let result = self.rewrite_uncached(e);
        self.visited.insert(key, result.clone());
        result
    }

    fn rewrite_uncached(&mut self, e: &ExprRef) -> ExprRef {
        if e.is_constant() {
            return e.clone();
        }
        match self.visitor.visit(e) {
            Action::ChangeTo(r) => return r,
            Action::SkipChildren => return e.clone(),
            Action::DoChildren => {}
        }
        if matches!(e.kind(), ExprKind::NotOptimized(_)) {
            return e.clone();
        }
        let result = if let ExprKind::Read { updates, index } = e.kind() {
            let new_updates = self.rewrite_updates(updates);
            let new_index = self.rewrite(index);
            if Rc::ptr_eq(&new_index, index) && new_updates.compare(updates) == std::cmp::Ordering::Equal
            {
                e.clone()
            } else {
                let rebuilt = Expr::read(new_updates, new_index);
                if rebuilt.tag().is_none() {
                    rebuilt.set_tag(e.tag());
                }
                rebuilt
            }
        } else {
            let kids = e.kids();
            let new_kids: Vec<ExprRef> = kids.iter().map(|k| self.rewrite(k)).collect();
            if kids
                .iter()
                .zip(new_kids.iter())
                .all(|(a, b)| Rc::ptr_eq(a, b))
            {
                e.clone()
            } else {
                e.rebuild(&new_kids)
            }
        };
        if !Rc::ptr_eq(&result, e) && !result.is_constant() {
            if let Action::ChangeTo(r) = self.visitor.visit(&result) {
                return r;
            }
        }
        result
    }

    fn rewrite_updates(&mut self, updates: &UpdateList) -> UpdateList {
        let head = updates.head().map(|h| self.rewrite_node(h));
        UpdateList::new(updates.root().clone(), head)
    }

    fn rewrite_node(&mut self, node: &UpdateNodeRef) -> UpdateNodeRef {
        let key = Rc::as_ptr(node) as usize;
        if let Some(done) = self.visited_un.get(&key) {
            return done.clone();
        }
        let next = node.next.as_ref().map(|n| self.rewrite_node(n));
        let index = self.rewrite(&node.index);
        let value = self.rewrite(&node.value);
        let unchanged = Rc::ptr_eq(&index, &node.index)
            && Rc::ptr_eq(&value, &node.value)
            && match (&next, &node.next) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            };
        let result = if unchanged {
            node.clone()
        } else {
            self.shared_un.dedup(UpdateNode::new(next, index, value))
        };
        self.visited_un.insert(key, result.clone());
        result
    }
}

/// Substitutes every expression present in the map (keyed on interned node
/// identity) by its image. Used for equality substitution.
pub struct ReplaceMapVisitor<'m> {
    map: &'m HashMap<usize, ExprRef>,
}

impl<'m> ReplaceMapVisitor<'m> {
    pub fn new(map: &'m HashMap<usize, ExprRef>) -> Self {
        Self { map }
    }
}

impl ExprRewriter for ReplaceMapVisitor<'_> {
    fn visit(&mut self, e: &ExprRef) -> Action {
        match self.map.get(&(Rc::as_ptr(e) as usize)) {
            Some(r) => Action::ChangeTo(r.clone()),
            None => Action::DoChildren,
        }
    }
}

/// Substitutes one expression by another.
pub struct ReplaceOneVisitor {
    src: ExprRef,
    dst: ExprRef,
}

impl ReplaceOneVisitor {
    pub fn new(src: ExprRef, dst: ExprRef) -> Self {
        Self { src, dst }
    }
}

impl ExprRewriter for ReplaceOneVisitor {
    fn visit(&mut self, e: &ExprRef) -> Action {
        if Rc::ptr_eq(e, &self.src) {
            Action::ChangeTo(self.dst.clone())
        } else {
            Action::DoChildren
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ExprContext, INT32};

    #[test]
    fn replaces_through_shared_subtrees() {
        let a = ExprContext::with(|cx| cx.arrays.symbolic("vtest", 8));
        let x = Expr::zext(
            Expr::read(
                UpdateList::new(a.clone(), None),
                Expr::constant_u64(0, INT32),
            ),
            INT32,
        );
        let shared = Expr::add(Expr::constant_u64(1, INT32), x.clone());
        let top = Expr::mul(shared.clone(), shared.clone());

        let five = Expr::constant_u64(5, INT32);
        let mut visitor = ReplaceOneVisitor::new(x, five);
        let mut shared_un = UpdateNodeCache::default();
        let rewritten = RewriteDriver::new(&mut visitor, &mut shared_un).rewrite(&top);
        assert_eq!(
            rewritten.as_constant().map(|v| v.as_u64()),
            Some(36),
            "got {}",
            rewritten
        );
    }

    #[test]
    fn not_optimized_blocks_substitution() {
        let a = ExprContext::with(|cx| cx.arrays.symbolic("vtest2", 8));
        let x = Expr::zext(
            Expr::read(
                UpdateList::new(a.clone(), None),
                Expr::constant_u64(0, INT32),
            ),
            INT32,
        );
        let wrapped = Expr::not_optimized(x.clone());
        let top = Expr::add(Expr::constant_u64(1, INT32), wrapped.clone());

        let mut visitor = ReplaceOneVisitor::new(x, Expr::constant_u64(9, INT32));
        let mut shared_un = UpdateNodeCache::default();
        let rewritten = RewriteDriver::new(&mut visitor, &mut shared_un).rewrite(&top);
        assert!(!rewritten.is_constant());
    }
}
