//! Symbolic arrays and persistent update lists.
//!
//! Arrays model the contents of memory objects: either fully symbolic or a
//! vector of constant values (the result of promoting a concrete object).
//! Writes never mutate; they extend a shared singly-linked update chain.

use super::{compare, BitVec, ExprRef, Width, INT32, INT8, MAGIC_HASH_CONSTANT};
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

pub type ArrayRef = Rc<Array>;

pub struct Array {
    name: String,
    size: u32,
    domain: Width,
    range: Width,
    constants: Vec<BitVec>,
    hash: u32,
    id: u64,
}

impl Array {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn domain(&self) -> Width {
        self.domain
    }

    pub fn range(&self) -> Width {
        self.range
    }

    /// Cache-assigned identity, stable for the lifetime of the engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn is_symbolic(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn is_constant(&self) -> bool {
        !self.constants.is_empty()
    }

    pub fn constant_at(&self, index: u64) -> Option<BitVec> {
        if self.is_constant() && index < u64::from(self.size) {
            Some(self.constants[index as usize])
        } else {
            None
        }
    }

    pub fn constant_values(&self) -> &[BitVec] {
        &self.constants
    }

    fn content_hash(name: &str, size: u32, constants: &[BitVec]) -> u32 {
        let mut res = size.wrapping_mul(MAGIC_HASH_CONSTANT);
        for b in name.bytes() {
            res = (res << 1) ^ u32::from(b).wrapping_mul(MAGIC_HASH_CONSTANT);
        }
        for v in constants {
            res = res.rotate_left(5) ^ (v.bits() as u32).wrapping_mul(MAGIC_HASH_CONSTANT);
        }
        res
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.size)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Arrays live for the lifetime of the engine and are deduplicated by
/// content so states forked from one another keep sharing them.
#[derive(Default)]
pub struct ArrayCache {
    buckets: std::collections::HashMap<u32, Vec<ArrayRef>>,
    next_id: u64,
}

impl ArrayCache {
    pub fn symbolic(&mut self, name: &str, size: u32) -> ArrayRef {
        self.create(name, size, Vec::new())
    }

    pub fn constant(&mut self, name: &str, values: Vec<BitVec>) -> ArrayRef {
        let size = values.len() as u32;
        self.create(name, size, values)
    }

    pub fn constant_bytes(&mut self, name: &str, bytes: &[u8]) -> ArrayRef {
        let values = bytes
            .iter()
            .map(|&b| BitVec::new(u128::from(b), INT8))
            .collect();
        self.constant(name, values)
    }

    fn create(&mut self, name: &str, size: u32, constants: Vec<BitVec>) -> ArrayRef {
        let hash = Array::content_hash(name, size, &constants);
        let bucket = self.buckets.entry(hash).or_default();
        for existing in bucket.iter() {
            if existing.name == name && existing.size == size && existing.constants == constants {
                return existing.clone();
            }
        }
        self.next_id += 1;
        let fresh = Rc::new(Array {
            name: name.to_owned(),
            size,
            domain: INT32,
            range: INT8,
            constants,
            hash,
            id: self.next_id,
        });
        bucket.push(fresh.clone());
        fresh
    }
}

pub type UpdateNodeRef = Rc<UpdateNode>;

/// One byte-write in the history of an array. `size` is the chain length
/// from this node inclusive.
pub struct UpdateNode {
    pub next: Option<UpdateNodeRef>,
    pub index: ExprRef,
    pub value: ExprRef,
    size: u32,
    hash: u32,
}

impl UpdateNode {
    pub fn new(next: Option<UpdateNodeRef>, index: ExprRef, value: ExprRef) -> UpdateNodeRef {
        let size = next.as_ref().map_or(0, |n| n.size) + 1;
        let next_hash = next.as_ref().map_or(0, |n| n.hash);
        let hash = (next_hash << 1)
            ^ index.hash().wrapping_mul(MAGIC_HASH_CONSTANT)
            ^ value.hash().rotate_left(13);
        Rc::new(UpdateNode {
            next,
            index,
            value,
            size,
            hash,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Lexicographic on index, value, then the rest of the chain.
    pub fn compare(&self, other: &UpdateNode) -> Ordering {
        if std::ptr::eq(self, other) {
            return Ordering::Equal;
        }
        match self.size.cmp(&other.size) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match compare(&self.index, &other.index) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match compare(&self.value, &other.value) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (&self.next, &other.next) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.compare(b),
        }
    }
}

/// An array plus the history of writes applied over it. Reading walks the
/// chain head-first for the youngest matching write.
#[derive(Clone)]
pub struct UpdateList {
    root: ArrayRef,
    head: Option<UpdateNodeRef>,
}

impl UpdateList {
    pub fn new(root: ArrayRef, head: Option<UpdateNodeRef>) -> Self {
        Self { root, head }
    }

    pub fn root(&self) -> &ArrayRef {
        &self.root
    }

    pub fn head(&self) -> Option<&UpdateNodeRef> {
        self.head.as_ref()
    }

    pub fn len(&self) -> u32 {
        self.head.as_ref().map_or(0, |n| n.size)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// A fresh write becomes the new head; the previous chain stays shared.
    pub fn extend(&mut self, index: ExprRef, value: ExprRef) {
        debug_assert_eq!(index.width(), self.root.domain());
        debug_assert_eq!(value.width(), self.root.range());
        self.head = Some(UpdateNode::new(self.head.take(), index, value));
    }

    pub fn hash(&self) -> u32 {
        let root = (self.root.hash()).wrapping_mul(MAGIC_HASH_CONSTANT);
        match &self.head {
            Some(h) => root ^ h.hash(),
            None => root,
        }
    }

    pub fn compare(&self, other: &UpdateList) -> Ordering {
        match self.root.id().cmp(&other.root.id()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (&self.head, &other.head) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => {
                if Rc::ptr_eq(a, b) {
                    Ordering::Equal
                } else {
                    a.compare(b)
                }
            }
        }
    }

    /// Iterates the chain from the most recent write backwards.
    pub fn iter(&self) -> UpdateIter<'_> {
        UpdateIter {
            node: self.head.as_deref(),
        }
    }
}

impl fmt::Display for UpdateList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}w", self.root, self.len())
    }
}

impl fmt::Debug for UpdateList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub struct UpdateIter<'a> {
    node: Option<&'a UpdateNode>,
}

impl<'a> Iterator for UpdateIter<'a> {
    type Item = &'a UpdateNode;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.node?;
        self.node = current.next.as_deref();
        Some(current)
    }
}
