//! The hash-consed bit-vector expression algebra.
//!
//! Expressions are immutable reference-counted DAG nodes. The smart
//! constructors fold constants, normalize booleans and push constants to the
//! left of commutative operators, so every consumer can rely on the
//! canonical forms when pattern matching. Structurally equal nodes are
//! deduplicated through a thread-local interning table, which makes
//! structural equality coincide with pointer identity.

pub mod array;
pub mod assignment;
pub mod visitor;

pub use array::{Array, ArrayRef, UpdateList, UpdateNode, UpdateNodeRef};
pub use assignment::Assignment;

use log::trace;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// The type of an expression is simply its width in bits.
pub type Width = u32;

pub const BOOL: Width = 1;
pub const INT8: Width = 8;
pub const INT16: Width = 16;
pub const INT32: Width = 32;
pub const INT64: Width = 64;
pub const FL80: Width = 80;

/// Pointers in interpreted programs are 64 bits wide.
pub const PTR_WIDTH: Width = 64;

const MAGIC_HASH_CONSTANT: u32 = 39;

/// Identifies the LLIR instruction that created an expression. Carried as an
/// advisory attribute: it neither hashes nor compares.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct InstTag {
    pub func: u32,
    pub block: u32,
    pub inst: u32,
}

impl fmt::Display for InstTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "f{}.b{}.i{}", self.func, self.block, self.inst)
    }
}

/// A fixed-width two's-complement bit-vector value. All operations are
/// modulo `2^width`; division follows SMT-LIB semantics for zero divisors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BitVec {
    bits: u128,
    width: Width,
}

impl BitVec {
    fn mask(width: Width) -> u128 {
        if width >= 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        }
    }

    pub fn new(bits: u128, width: Width) -> Self {
        debug_assert!(width > 0 && width <= 128);
        Self {
            bits: bits & Self::mask(width),
            width,
        }
    }

    pub fn bool(value: bool) -> Self {
        Self::new(u128::from(value), BOOL)
    }

    pub fn zero(width: Width) -> Self {
        Self::new(0, width)
    }

    pub fn ones(width: Width) -> Self {
        Self::new(u128::MAX, width)
    }

    pub fn bits(&self) -> u128 {
        self.bits
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn as_u64(&self) -> u64 {
        self.bits as u64
    }

    pub fn is_zero(&self) -> bool {
        self.bits == 0
    }

    pub fn is_true(&self) -> bool {
        self.width == BOOL && self.bits == 1
    }

    pub fn is_false(&self) -> bool {
        self.width == BOOL && self.bits == 0
    }

    pub fn is_ones(&self) -> bool {
        self.bits == Self::mask(self.width)
    }

    /// The value reinterpreted as a signed integer.
    pub fn signed(&self) -> i128 {
        let sign = 1u128 << (self.width - 1);
        if self.width < 128 && self.bits & sign != 0 {
            (self.bits | !Self::mask(self.width)) as i128
        } else {
            self.bits as i128
        }
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.bits.wrapping_add(rhs.bits), self.width)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.bits.wrapping_sub(rhs.bits), self.width)
    }

    pub fn mul(self, rhs: Self) -> Self {
        Self::new(self.bits.wrapping_mul(rhs.bits), self.width)
    }

    pub fn neg(self) -> Self {
        Self::new(self.bits.wrapping_neg(), self.width)
    }

    pub fn udiv(self, rhs: Self) -> Self {
        if rhs.bits == 0 {
            Self::ones(self.width)
        } else {
            Self::new(self.bits / rhs.bits, self.width)
        }
    }

    pub fn urem(self, rhs: Self) -> Self {
        if rhs.bits == 0 {
            self
        } else {
            Self::new(self.bits % rhs.bits, self.width)
        }
    }

    pub fn sdiv(self, rhs: Self) -> Self {
        if rhs.bits == 0 {
            if self.signed() >= 0 {
                Self::ones(self.width)
            } else {
                Self::new(1, self.width)
            }
        } else {
            Self::new(self.signed().wrapping_div(rhs.signed()) as u128, self.width)
        }
    }

    pub fn srem(self, rhs: Self) -> Self {
        if rhs.bits == 0 {
            self
        } else {
            Self::new(self.signed().wrapping_rem(rhs.signed()) as u128, self.width)
        }
    }

    pub fn and(self, rhs: Self) -> Self {
        Self::new(self.bits & rhs.bits, self.width)
    }

    pub fn or(self, rhs: Self) -> Self {
        Self::new(self.bits | rhs.bits, self.width)
    }

    pub fn xor(self, rhs: Self) -> Self {
        Self::new(self.bits ^ rhs.bits, self.width)
    }

    pub fn not(self) -> Self {
        Self::new(!self.bits, self.width)
    }

    pub fn shl(self, rhs: Self) -> Self {
        if rhs.bits >= u128::from(self.width) {
            Self::zero(self.width)
        } else {
            Self::new(self.bits << rhs.bits, self.width)
        }
    }

    pub fn lshr(self, rhs: Self) -> Self {
        if rhs.bits >= u128::from(self.width) {
            Self::zero(self.width)
        } else {
            Self::new(self.bits >> rhs.bits, self.width)
        }
    }

    pub fn ashr(self, rhs: Self) -> Self {
        if rhs.bits >= u128::from(self.width) {
            if self.signed() < 0 {
                Self::ones(self.width)
            } else {
                Self::zero(self.width)
            }
        } else {
            Self::new((self.signed() >> rhs.bits) as u128, self.width)
        }
    }

    pub fn ult(self, rhs: Self) -> bool {
        self.bits < rhs.bits
    }

    pub fn ule(self, rhs: Self) -> bool {
        self.bits <= rhs.bits
    }

    pub fn slt(self, rhs: Self) -> bool {
        self.signed() < rhs.signed()
    }

    pub fn sle(self, rhs: Self) -> bool {
        self.signed() <= rhs.signed()
    }

    pub fn zext(self, width: Width) -> Self {
        debug_assert!(width >= self.width);
        Self::new(self.bits, width)
    }

    pub fn sext(self, width: Width) -> Self {
        debug_assert!(width >= self.width);
        Self::new(self.signed() as u128, width)
    }

    pub fn extract(self, offset: Width, width: Width) -> Self {
        debug_assert!(offset + width <= self.width);
        Self::new(self.bits >> offset, width)
    }

    /// `self` forms the high bits, `rhs` the low bits.
    pub fn concat(self, rhs: Self) -> Self {
        debug_assert!(self.width + rhs.width <= 128);
        Self::new((self.bits << rhs.width) | rhs.bits, self.width + rhs.width)
    }
}

impl fmt::Display for BitVec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}:{}", self.bits, self.width)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor
        )
    }

    fn apply(self, l: BitVec, r: BitVec) -> BitVec {
        match self {
            BinaryOp::Add => l.add(r),
            BinaryOp::Sub => l.sub(r),
            BinaryOp::Mul => l.mul(r),
            BinaryOp::UDiv => l.udiv(r),
            BinaryOp::SDiv => l.sdiv(r),
            BinaryOp::URem => l.urem(r),
            BinaryOp::SRem => l.srem(r),
            BinaryOp::And => l.and(r),
            BinaryOp::Or => l.or(r),
            BinaryOp::Xor => l.xor(r),
            BinaryOp::Shl => l.shl(r),
            BinaryOp::LShr => l.lshr(r),
            BinaryOp::AShr => l.ashr(r),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::UDiv => "UDiv",
            BinaryOp::SDiv => "SDiv",
            BinaryOp::URem => "URem",
            BinaryOp::SRem => "SRem",
            BinaryOp::And => "And",
            BinaryOp::Or => "Or",
            BinaryOp::Xor => "Xor",
            BinaryOp::Shl => "Shl",
            BinaryOp::LShr => "LShr",
            BinaryOp::AShr => "AShr",
        };
        write!(f, "{}", s)
    }
}

/// Canonical comparison operators; `Ne`, `Ugt`, `Uge`, `Sgt` and `Sge` are
/// rewritten by the constructors and never appear in a built expression.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum CompareOp {
    Eq,
    Ult,
    Ule,
    Slt,
    Sle,
}

impl CompareOp {
    fn apply(self, l: BitVec, r: BitVec) -> bool {
        match self {
            CompareOp::Eq => l == r,
            CompareOp::Ult => l.ult(r),
            CompareOp::Ule => l.ule(r),
            CompareOp::Slt => l.slt(r),
            CompareOp::Sle => l.sle(r),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "Eq",
            CompareOp::Ult => "Ult",
            CompareOp::Ule => "Ule",
            CompareOp::Slt => "Slt",
            CompareOp::Sle => "Sle",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Constant(BitVec),
    /// Opaque wrapper: neither the constructors nor the visitors simplify
    /// across it.
    NotOptimized(ExprRef),
    Read {
        updates: UpdateList,
        index: ExprRef,
    },
    Select {
        cond: ExprRef,
        on_true: ExprRef,
        on_false: ExprRef,
    },
    Concat {
        left: ExprRef,
        right: ExprRef,
    },
    Extract {
        src: ExprRef,
        offset: Width,
    },
    ZExt(ExprRef),
    SExt(ExprRef),
    Not(ExprRef),
    Binary {
        op: BinaryOp,
        left: ExprRef,
        right: ExprRef,
    },
    Compare {
        op: CompareOp,
        left: ExprRef,
        right: ExprRef,
    },
}

pub type ExprRef = Rc<Expr>;

pub struct Expr {
    kind: ExprKind,
    width: Width,
    hash: u32,
    tag: Cell<Option<InstTag>>,
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Expr {
    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn tag(&self) -> Option<InstTag> {
        self.tag.get()
    }

    pub fn set_tag(&self, tag: Option<InstTag>) {
        self.tag.set(tag);
    }

    pub fn is_bool(&self) -> bool {
        self.width == BOOL
    }

    pub fn as_constant(&self) -> Option<BitVec> {
        match self.kind {
            ExprKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ExprKind::Constant(_))
    }

    pub fn is_true(&self) -> bool {
        matches!(self.kind, ExprKind::Constant(v) if v.is_true())
    }

    pub fn is_false(&self) -> bool {
        matches!(self.kind, ExprKind::Constant(v) if v.is_false())
    }

    fn kind_discriminant(&self) -> u32 {
        match &self.kind {
            ExprKind::Constant(_) => 0,
            ExprKind::NotOptimized(_) => 1,
            ExprKind::Read { .. } => 2,
            ExprKind::Select { .. } => 3,
            ExprKind::Concat { .. } => 4,
            ExprKind::Extract { .. } => 5,
            ExprKind::ZExt(_) => 6,
            ExprKind::SExt(_) => 7,
            ExprKind::Not(_) => 8,
            ExprKind::Binary { op, .. } => 9 + *op as u32,
            ExprKind::Compare { op, .. } => 22 + *op as u32,
        }
    }

    pub fn kids(&self) -> Vec<ExprRef> {
        match &self.kind {
            ExprKind::Constant(_) => vec![],
            ExprKind::NotOptimized(e)
            | ExprKind::Extract { src: e, .. }
            | ExprKind::ZExt(e)
            | ExprKind::SExt(e)
            | ExprKind::Not(e) => vec![e.clone()],
            ExprKind::Read { index, .. } => vec![index.clone()],
            ExprKind::Select {
                cond,
                on_true,
                on_false,
            } => vec![cond.clone(), on_true.clone(), on_false.clone()],
            ExprKind::Concat { left, right }
            | ExprKind::Binary { left, right, .. }
            | ExprKind::Compare { left, right, .. } => vec![left.clone(), right.clone()],
        }
    }

    /// Re-runs the canonicalizing constructor of this node's kind with
    /// replacement kids. `rebuild(kids())` returns the node itself.
    pub fn rebuild(&self, kids: &[ExprRef]) -> ExprRef {
        let result = match &self.kind {
            ExprKind::Constant(_) => unreachable!("rebuild() on a constant"),
            ExprKind::NotOptimized(_) => Expr::not_optimized(kids[0].clone()),
            ExprKind::Read { updates, .. } => Expr::read(updates.clone(), kids[0].clone()),
            ExprKind::Select { .. } => {
                Expr::select(kids[0].clone(), kids[1].clone(), kids[2].clone())
            }
            ExprKind::Concat { .. } => Expr::concat(kids[0].clone(), kids[1].clone()),
            ExprKind::Extract { offset, .. } => Expr::extract(kids[0].clone(), *offset, self.width),
            ExprKind::ZExt(_) => Expr::zext(kids[0].clone(), self.width),
            ExprKind::SExt(_) => Expr::sext(kids[0].clone(), self.width),
            ExprKind::Not(_) => Expr::not(kids[0].clone()),
            ExprKind::Binary { op, .. } => Expr::binary(*op, kids[0].clone(), kids[1].clone()),
            ExprKind::Compare { op, .. } => Expr::compare(*op, kids[0].clone(), kids[1].clone()),
        };
        if result.tag().is_none() {
            result.set_tag(self.tag());
        }
        result
    }
}

fn compute_hash(kind: &ExprKind, width: Width) -> u32 {
    match kind {
        ExprKind::Constant(v) => {
            let b = v.bits();
            let lo = b as u32;
            let mid = (b >> 32) as u32;
            let hi = (b >> 64) as u32;
            (lo ^ mid.rotate_left(11) ^ hi.rotate_left(23))
                .wrapping_mul(MAGIC_HASH_CONSTANT)
                .wrapping_add(width.wrapping_mul(MAGIC_HASH_CONSTANT))
        }
        _ => {
            let disc = match kind {
                ExprKind::NotOptimized(_) => 1u32,
                ExprKind::Read { .. } => 2,
                ExprKind::Select { .. } => 3,
                ExprKind::Concat { .. } => 4,
                ExprKind::Extract { .. } => 5,
                ExprKind::ZExt(_) => 6,
                ExprKind::SExt(_) => 7,
                ExprKind::Not(_) => 8,
                ExprKind::Binary { op, .. } => 9 + *op as u32,
                ExprKind::Compare { op, .. } => 22 + *op as u32,
                ExprKind::Constant(_) => unreachable!(),
            };
            let mut res = disc.wrapping_mul(MAGIC_HASH_CONSTANT) ^ width.rotate_left(7);
            let mix_kid = |res: &mut u32, h: u32| {
                *res = (*res << 1) ^ h.wrapping_mul(MAGIC_HASH_CONSTANT);
            };
            match kind {
                ExprKind::NotOptimized(e)
                | ExprKind::ZExt(e)
                | ExprKind::SExt(e)
                | ExprKind::Not(e) => mix_kid(&mut res, e.hash()),
                ExprKind::Extract { src, offset } => {
                    mix_kid(&mut res, src.hash());
                    res ^= offset.wrapping_mul(MAGIC_HASH_CONSTANT);
                }
                ExprKind::Read { updates, index } => {
                    mix_kid(&mut res, index.hash());
                    res ^= updates.hash().wrapping_mul(MAGIC_HASH_CONSTANT);
                }
                ExprKind::Select {
                    cond,
                    on_true,
                    on_false,
                } => {
                    mix_kid(&mut res, cond.hash());
                    mix_kid(&mut res, on_true.hash());
                    mix_kid(&mut res, on_false.hash());
                }
                ExprKind::Concat { left, right }
                | ExprKind::Binary { left, right, .. }
                | ExprKind::Compare { left, right, .. } => {
                    mix_kid(&mut res, left.hash());
                    mix_kid(&mut res, right.hash());
                }
                ExprKind::Constant(_) => unreachable!(),
            }
            res
        }
    }
}

/// Shallow structural equality used by the interning table. Children are
/// already interned, so pointer identity decides them.
fn shallow_eq(a: &Expr, b: &Expr) -> bool {
    if a.width != b.width {
        return false;
    }
    match (&a.kind, &b.kind) {
        (ExprKind::Constant(x), ExprKind::Constant(y)) => x == y,
        (ExprKind::NotOptimized(x), ExprKind::NotOptimized(y))
        | (ExprKind::ZExt(x), ExprKind::ZExt(y))
        | (ExprKind::SExt(x), ExprKind::SExt(y))
        | (ExprKind::Not(x), ExprKind::Not(y)) => Rc::ptr_eq(x, y),
        (
            ExprKind::Extract { src: x, offset: o1 },
            ExprKind::Extract { src: y, offset: o2 },
        ) => o1 == o2 && Rc::ptr_eq(x, y),
        (
            ExprKind::Read {
                updates: u1,
                index: i1,
            },
            ExprKind::Read {
                updates: u2,
                index: i2,
            },
        ) => Rc::ptr_eq(i1, i2) && u1.compare(u2) == Ordering::Equal,
        (
            ExprKind::Select {
                cond: c1,
                on_true: t1,
                on_false: f1,
            },
            ExprKind::Select {
                cond: c2,
                on_true: t2,
                on_false: f2,
            },
        ) => Rc::ptr_eq(c1, c2) && Rc::ptr_eq(t1, t2) && Rc::ptr_eq(f1, f2),
        (
            ExprKind::Concat {
                left: l1,
                right: r1,
            },
            ExprKind::Concat {
                left: l2,
                right: r2,
            },
        ) => Rc::ptr_eq(l1, l2) && Rc::ptr_eq(r1, r2),
        (
            ExprKind::Binary {
                op: o1,
                left: l1,
                right: r1,
            },
            ExprKind::Binary {
                op: o2,
                left: l2,
                right: r2,
            },
        ) => o1 == o2 && Rc::ptr_eq(l1, l2) && Rc::ptr_eq(r1, r2),
        (
            ExprKind::Compare {
                op: o1,
                left: l1,
                right: r1,
            },
            ExprKind::Compare {
                op: o2,
                left: l2,
                right: r2,
            },
        ) => o1 == o2 && Rc::ptr_eq(l1, l2) && Rc::ptr_eq(r1, r2),
        _ => false,
    }
}

/// The compare cache lives in its own cell so that deep comparisons may run
/// while the interning table is borrowed.
#[derive(Default)]
struct CompareCache {
    equal_pairs: std::collections::HashSet<(usize, usize)>,
    semaphore: u64,
}

thread_local! {
    static COMPARE_CACHE: RefCell<CompareCache> = RefCell::new(CompareCache::default());
}

/// Total structural order over expressions: hash first, then kind, width,
/// children in order, then kind-specific attributes.
pub fn compare(a: &ExprRef, b: &ExprRef) -> Ordering {
    if Rc::ptr_eq(a, b) {
        return Ordering::Equal;
    }
    let key = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
    if COMPARE_CACHE.with(|c| c.borrow().equal_pairs.contains(&key)) {
        return Ordering::Equal;
    }
    let result = compare_uncached(a, b);
    if result == Ordering::Equal {
        COMPARE_CACHE.with(|c| {
            let mut cache = c.borrow_mut();
            if cache.semaphore > 0 {
                cache.equal_pairs.insert(key);
                cache.equal_pairs.insert((key.1, key.0));
            }
        });
    }
    result
}

fn compare_uncached(a: &ExprRef, b: &ExprRef) -> Ordering {
    match a.hash().cmp(&b.hash()) {
        Ordering::Equal => {}
        ord => return ord,
    }
    match a.kind_discriminant().cmp(&b.kind_discriminant()) {
        Ordering::Equal => {}
        ord => return ord,
    }
    match a.width().cmp(&b.width()) {
        Ordering::Equal => {}
        ord => return ord,
    }
    let (ka, kb) = (a.kids(), b.kids());
    match ka.len().cmp(&kb.len()) {
        Ordering::Equal => {}
        ord => return ord,
    }
    for (x, y) in ka.iter().zip(kb.iter()) {
        match compare(x, y) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    match (&a.kind, &b.kind) {
        (ExprKind::Constant(x), ExprKind::Constant(y)) => match x.width().cmp(&y.width()) {
            Ordering::Equal => x.bits().cmp(&y.bits()),
            ord => ord,
        },
        (ExprKind::Extract { offset: o1, .. }, ExprKind::Extract { offset: o2, .. }) => {
            o1.cmp(o2)
        }
        (ExprKind::Read { updates: u1, .. }, ExprKind::Read { updates: u2, .. }) => u1.compare(u2),
        _ => Ordering::Equal,
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.hash == other.hash && self.width == other.width && {
            // Interned children make a shallow check sufficient.
            shallow_eq(self, other)
        }
    }
}

impl Eq for Expr {}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ExprKind::Constant(v) => write!(f, "{}", v),
            ExprKind::NotOptimized(e) => write!(f, "(NotOptimized {})", e),
            ExprKind::Read { updates, index } => {
                write!(f, "(Read:{} {} {})", self.width, updates, index)
            }
            ExprKind::Select {
                cond,
                on_true,
                on_false,
            } => write!(f, "(Select {} {} {})", cond, on_true, on_false),
            ExprKind::Concat { left, right } => write!(f, "(Concat {} {})", left, right),
            ExprKind::Extract { src, offset } => {
                write!(f, "(Extract:{} @{} {})", self.width, offset, src)
            }
            ExprKind::ZExt(e) => write!(f, "(ZExt:{} {})", self.width, e),
            ExprKind::SExt(e) => write!(f, "(SExt:{} {})", self.width, e),
            ExprKind::Not(e) => write!(f, "(Not {})", e),
            ExprKind::Binary { op, left, right } => write!(f, "({} {} {})", op, left, right),
            ExprKind::Compare { op, left, right } => write!(f, "({} {} {})", op, left, right),
        }
    }
}

/// Process-wide algebra state: the interning table, the compare cache and
/// its semaphore, and the array cache. Thread-local because the engine is
/// single-threaded cooperative; one context exists per engine.
pub struct ExprContext {
    interner: HashMap<u32, Vec<Weak<Expr>>>,
    pub(crate) arrays: array::ArrayCache,
    interned: u64,
    hits: u64,
}

thread_local! {
    static CONTEXT: RefCell<ExprContext> = RefCell::new(ExprContext::new());
}

impl ExprContext {
    fn new() -> Self {
        Self {
            interner: HashMap::new(),
            arrays: array::ArrayCache::default(),
            interned: 0,
            hits: 0,
        }
    }

    pub fn with<R>(f: impl FnOnce(&mut ExprContext) -> R) -> R {
        CONTEXT.with(|cx| f(&mut cx.borrow_mut()))
    }

    fn intern(&mut self, expr: Expr) -> ExprRef {
        let bucket = self.interner.entry(expr.hash).or_default();
        bucket.retain(|w| w.strong_count() > 0);
        for weak in bucket.iter() {
            if let Some(existing) = weak.upgrade() {
                if shallow_eq(&existing, &expr) {
                    self.hits += 1;
                    return existing;
                }
            }
        }
        let fresh = Rc::new(expr);
        bucket.push(Rc::downgrade(&fresh));
        self.interned += 1;
        if self.interned % 0x10_0000 == 0 {
            trace!(
                "expression context: {} interned, {} hits, {} buckets",
                self.interned,
                self.hits,
                self.interner.len()
            );
        }
        fresh
    }
}

/// RAII bracket for the compare-cache semaphore. Cached pointer pairs stay
/// valid only while at least one holder is alive; the cache flushes when the
/// last one drops.
pub struct CompareCacheGuard(());

impl CompareCacheGuard {
    pub fn new() -> Self {
        COMPARE_CACHE.with(|c| c.borrow_mut().semaphore += 1);
        CompareCacheGuard(())
    }
}

impl Default for CompareCacheGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompareCacheGuard {
    fn drop(&mut self) {
        COMPARE_CACHE.with(|c| {
            let mut cache = c.borrow_mut();
            cache.semaphore -= 1;
            if cache.semaphore == 0 {
                cache.equal_pairs.clear();
            }
        });
    }
}

fn intern(kind: ExprKind, width: Width) -> ExprRef {
    let hash = compute_hash(&kind, width);
    ExprContext::with(|cx| {
        cx.intern(Expr {
            kind,
            width,
            hash,
            tag: Cell::new(None),
        })
    })
}

impl Expr {
    pub fn constant(value: BitVec) -> ExprRef {
        intern(ExprKind::Constant(value), value.width())
    }

    pub fn constant_u64(value: u64, width: Width) -> ExprRef {
        Self::constant(BitVec::new(u128::from(value), width))
    }

    pub fn bool_const(value: bool) -> ExprRef {
        Self::constant(BitVec::bool(value))
    }

    pub fn zero(width: Width) -> ExprRef {
        Self::constant(BitVec::zero(width))
    }

    pub fn pointer(value: u64) -> ExprRef {
        Self::constant_u64(value, PTR_WIDTH)
    }

    pub fn not_optimized(src: ExprRef) -> ExprRef {
        if src.is_constant() {
            return src;
        }
        let width = src.width();
        intern(ExprKind::NotOptimized(src), width)
    }

    /// A one-element read through an update list. Constant indices walk the
    /// list as far as indices are provably equal or unequal; the built node
    /// keeps only the undecided suffix.
    pub fn read(updates: UpdateList, index: ExprRef) -> ExprRef {
        debug_assert_eq!(index.width(), updates.root().domain());
        let range = updates.root().range();
        if let Some(i) = index.as_constant() {
            let mut head = updates.head().cloned();
            while let Some(node) = head {
                match node.index.as_constant() {
                    Some(ui) if ui == i => return node.value.clone(),
                    Some(_) => head = node.next.clone(),
                    None => {
                        head = Some(node);
                        break;
                    }
                }
            }
            if head.is_none() {
                if let Some(value) = updates.root().constant_at(i.as_u64()) {
                    return Expr::constant(value);
                }
            }
            let suffix = UpdateList::new(updates.root().clone(), head);
            return intern(
                ExprKind::Read {
                    updates: suffix,
                    index,
                },
                range,
            );
        }
        intern(ExprKind::Read { updates, index }, range)
    }

    pub fn select(cond: ExprRef, on_true: ExprRef, on_false: ExprRef) -> ExprRef {
        debug_assert!(cond.is_bool());
        debug_assert_eq!(on_true.width(), on_false.width());
        if let Some(c) = cond.as_constant() {
            return if c.is_true() { on_true } else { on_false };
        }
        if Rc::ptr_eq(&on_true, &on_false) {
            return on_true;
        }
        if on_true.is_bool() {
            if on_true.is_true() && on_false.is_false() {
                return cond;
            }
            if on_true.is_false() && on_false.is_true() {
                return Expr::logical_not(cond);
            }
        }
        let width = on_true.width();
        intern(
            ExprKind::Select {
                cond,
                on_true,
                on_false,
            },
            width,
        )
    }

    /// `left` supplies the high bits. Chains are kept right-leaning and
    /// adjacent extracts of one source are merged.
    pub fn concat(left: ExprRef, right: ExprRef) -> ExprRef {
        if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
            return Expr::constant(l.concat(r));
        }
        // Fold a constant prefix into a constant head of the right chain.
        if let ExprKind::Concat {
            left: rl,
            right: rr,
        } = &right.kind
        {
            if let (Some(l), Some(rlc)) = (left.as_constant(), rl.as_constant()) {
                return Expr::concat(Expr::constant(l.concat(rlc)), rr.clone());
            }
        }
        // Rebalance to the right.
        if let ExprKind::Concat {
            left: ll,
            right: lr,
        } = &left.kind
        {
            return Expr::concat(ll.clone(), Expr::concat(lr.clone(), right.clone()));
        }
        // Merge contiguous extracts of the same source.
        if let (
            ExprKind::Extract {
                src: s1,
                offset: o1,
            },
            ExprKind::Extract {
                src: s2,
                offset: o2,
            },
        ) = (&left.kind, &right.kind)
        {
            if Rc::ptr_eq(s1, s2) && *o1 == o2 + right.width() {
                return Expr::extract(s1.clone(), *o2, left.width() + right.width());
            }
        }
        let width = left.width() + right.width();
        intern(ExprKind::Concat { left, right }, width)
    }

    pub fn extract(src: ExprRef, offset: Width, width: Width) -> ExprRef {
        debug_assert!(offset + width <= src.width());
        if width == src.width() {
            return src;
        }
        if let Some(v) = src.as_constant() {
            return Expr::constant(v.extract(offset, width));
        }
        match &src.kind {
            ExprKind::Concat { left, right } => {
                if offset + width <= right.width() {
                    return Expr::extract(right.clone(), offset, width);
                }
                if offset >= right.width() {
                    return Expr::extract(left.clone(), offset - right.width(), width);
                }
                let lo_width = right.width() - offset;
                let hi = Expr::extract(left.clone(), 0, width - lo_width);
                let lo = Expr::extract(right.clone(), offset, lo_width);
                return Expr::concat(hi, lo);
            }
            ExprKind::Extract {
                src: inner,
                offset: inner_offset,
            } => {
                return Expr::extract(inner.clone(), offset + inner_offset, width);
            }
            ExprKind::ZExt(inner) => {
                if offset + width <= inner.width() {
                    return Expr::extract(inner.clone(), offset, width);
                }
                if offset >= inner.width() {
                    return Expr::zero(width);
                }
            }
            ExprKind::SExt(inner) => {
                if offset + width <= inner.width() {
                    return Expr::extract(inner.clone(), offset, width);
                }
            }
            _ => {}
        }
        intern(ExprKind::Extract { src, offset }, width)
    }

    pub fn zext(src: ExprRef, width: Width) -> ExprRef {
        if width == src.width() {
            return src;
        }
        if width < src.width() {
            return Expr::extract(src, 0, width);
        }
        if let Some(v) = src.as_constant() {
            return Expr::constant(v.zext(width));
        }
        if let ExprKind::ZExt(inner) = &src.kind {
            return Expr::zext(inner.clone(), width);
        }
        intern(ExprKind::ZExt(src), width)
    }

    pub fn sext(src: ExprRef, width: Width) -> ExprRef {
        if width == src.width() {
            return src;
        }
        if width < src.width() {
            return Expr::extract(src, 0, width);
        }
        if let Some(v) = src.as_constant() {
            return Expr::constant(v.sext(width));
        }
        if let ExprKind::SExt(inner) = &src.kind {
            return Expr::sext(inner.clone(), width);
        }
        intern(ExprKind::SExt(src), width)
    }

    pub fn not(src: ExprRef) -> ExprRef {
        if let Some(v) = src.as_constant() {
            return Expr::constant(v.not());
        }
        if let ExprKind::Not(inner) = &src.kind {
            return inner.clone();
        }
        let width = src.width();
        intern(ExprKind::Not(src), width)
    }

    pub fn binary(op: BinaryOp, left: ExprRef, right: ExprRef) -> ExprRef {
        debug_assert_eq!(left.width(), right.width());
        let width = left.width();
        if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
            return Expr::constant(op.apply(l, r));
        }
        // Width-1 arithmetic degenerates to boolean connectives.
        if width == BOOL {
            match op {
                BinaryOp::Add | BinaryOp::Sub => return Expr::binary(BinaryOp::Xor, left, right),
                BinaryOp::Mul => return Expr::binary(BinaryOp::And, left, right),
                _ => {}
            }
        }
        // Subtraction by a constant is written Add(-c, x).
        if op == BinaryOp::Sub {
            if let Some(r) = right.as_constant() {
                return Expr::binary(BinaryOp::Add, Expr::constant(r.neg()), left);
            }
            if Rc::ptr_eq(&left, &right) {
                return Expr::zero(width);
            }
        }
        let (left, right) = if op.is_commutative() && right.is_constant() && !left.is_constant() {
            (right, left)
        } else {
            (left, right)
        };
        if let Some(l) = left.as_constant() {
            match op {
                BinaryOp::Add => {
                    if l.is_zero() {
                        return right;
                    }
                    if let ExprKind::Binary {
                        op: BinaryOp::Add,
                        left: rl,
                        right: rr,
                    } = &right.kind
                    {
                        if let Some(rlc) = rl.as_constant() {
                            return Expr::binary(
                                BinaryOp::Add,
                                Expr::constant(l.add(rlc)),
                                rr.clone(),
                            );
                        }
                    }
                }
                BinaryOp::Mul => {
                    if l.is_zero() {
                        return left;
                    }
                    if l.bits() == 1 {
                        return right;
                    }
                }
                BinaryOp::And => {
                    if l.is_zero() {
                        return left;
                    }
                    if l.is_ones() {
                        return right;
                    }
                }
                BinaryOp::Or => {
                    if l.is_zero() {
                        return right;
                    }
                    if l.is_ones() {
                        return left;
                    }
                }
                BinaryOp::Xor => {
                    if l.is_zero() {
                        return right;
                    }
                    // Boolean xor with true is negation, written Eq(false, x).
                    if l.is_true() {
                        return Expr::logical_not(right);
                    }
                }
                _ => {}
            }
        }
        if let Some(r) = right.as_constant() {
            match op {
                BinaryOp::UDiv | BinaryOp::SDiv if r.bits() == 1 => return left,
                BinaryOp::URem if r.bits() == 1 => return Expr::zero(width),
                BinaryOp::Shl | BinaryOp::LShr | BinaryOp::AShr if r.is_zero() => return left,
                BinaryOp::Shl | BinaryOp::LShr if r.bits() >= u128::from(width) => {
                    return Expr::zero(width)
                }
                _ => {}
            }
        }
        if Rc::ptr_eq(&left, &right) {
            match op {
                BinaryOp::And | BinaryOp::Or => return left,
                BinaryOp::Xor => return Expr::zero(width),
                _ => {}
            }
        }
        intern(ExprKind::Binary { op, left, right }, width)
    }

    pub fn compare(op: CompareOp, left: ExprRef, right: ExprRef) -> ExprRef {
        debug_assert_eq!(left.width(), right.width());
        if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
            return Expr::bool_const(op.apply(l, r));
        }
        if Rc::ptr_eq(&left, &right) {
            return match op {
                CompareOp::Eq | CompareOp::Ule | CompareOp::Sle => Expr::bool_const(true),
                CompareOp::Ult | CompareOp::Slt => Expr::bool_const(false),
            };
        }
        match op {
            CompareOp::Eq => return Expr::eq_create(left, right),
            CompareOp::Ult => {
                if let Some(r) = right.as_constant() {
                    if r.is_zero() {
                        return Expr::bool_const(false);
                    }
                }
                if let Some(l) = left.as_constant() {
                    if l.is_ones() {
                        return Expr::bool_const(false);
                    }
                }
            }
            CompareOp::Ule => {
                if let Some(l) = left.as_constant() {
                    if l.is_zero() {
                        return Expr::bool_const(true);
                    }
                }
                if let Some(r) = right.as_constant() {
                    if r.is_ones() {
                        return Expr::bool_const(true);
                    }
                }
            }
            _ => {}
        }
        intern(ExprKind::Compare { op, left, right }, BOOL)
    }

    fn eq_create(left: ExprRef, right: ExprRef) -> ExprRef {
        // Constant goes to the left.
        let (left, right) = if right.is_constant() && !left.is_constant() {
            (right, left)
        } else {
            (left, right)
        };
        if let Some(l) = left.as_constant() {
            if left.is_bool() {
                // The only boolean operation involving a constant is boolean
                // negation, Eq(false, x); Eq(true, x) is x itself.
                if l.is_true() {
                    return right;
                }
                if let ExprKind::Compare {
                    op: CompareOp::Eq,
                    left: il,
                    right: ir,
                } = &right.kind
                {
                    if il.is_false() {
                        return ir.clone();
                    }
                }
            }
            match &right.kind {
                ExprKind::Binary {
                    op: BinaryOp::Add,
                    left: rl,
                    right: rr,
                } => {
                    if let Some(c) = rl.as_constant() {
                        return Expr::eq_create(Expr::constant(l.sub(c)), rr.clone());
                    }
                }
                ExprKind::ZExt(inner) => {
                    let iw = inner.width();
                    if l.bits() >> iw != 0 {
                        return Expr::bool_const(false);
                    }
                    return Expr::eq_create(Expr::constant(l.extract(0, iw)), inner.clone());
                }
                ExprKind::SExt(inner) => {
                    let iw = inner.width();
                    let trunc = l.extract(0, iw);
                    if trunc.sext(l.width()) != l {
                        return Expr::bool_const(false);
                    }
                    return Expr::eq_create(Expr::constant(trunc), inner.clone());
                }
                _ => {}
            }
        }
        intern(
            ExprKind::Compare {
                op: CompareOp::Eq,
                left,
                right,
            },
            BOOL,
        )
    }

    // Convenience constructors mirroring the canonical operator set.

    pub fn add(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::Add, l, r)
    }

    pub fn sub(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::Sub, l, r)
    }

    pub fn mul(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::Mul, l, r)
    }

    pub fn and(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::And, l, r)
    }

    pub fn or(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::Or, l, r)
    }

    pub fn xor(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::Xor, l, r)
    }

    pub fn eq(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::compare(CompareOp::Eq, l, r)
    }

    pub fn ult(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::compare(CompareOp::Ult, l, r)
    }

    pub fn ule(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::compare(CompareOp::Ule, l, r)
    }

    pub fn slt(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::compare(CompareOp::Slt, l, r)
    }

    pub fn sle(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::compare(CompareOp::Sle, l, r)
    }

    // Non-canonical front-end aliases, rewritten on construction.

    pub fn ne(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::logical_not(Expr::eq(l, r))
    }

    pub fn ugt(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::ult(r, l)
    }

    pub fn uge(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::ule(r, l)
    }

    pub fn sgt(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::slt(r, l)
    }

    pub fn sge(l: ExprRef, r: ExprRef) -> ExprRef {
        Expr::sle(r, l)
    }

    /// `Eq(0, e)`; for booleans this is the canonical negation.
    pub fn is_zero(e: ExprRef) -> ExprRef {
        let width = e.width();
        Expr::eq(Expr::zero(width), e)
    }

    pub fn logical_not(e: ExprRef) -> ExprRef {
        debug_assert!(e.is_bool());
        Expr::eq(Expr::bool_const(false), e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn sym_array(name: &str, size: u32) -> ArrayRef {
        ExprContext::with(|cx| cx.arrays.symbolic(name, size))
    }

    fn byte_read(array: &ArrayRef, index: u64) -> ExprRef {
        Expr::read(
            UpdateList::new(array.clone(), None),
            Expr::constant_u64(index, INT32),
        )
    }

    #[test]
    fn interning_makes_equal_trees_pointer_identical() {
        let a = sym_array("itest", 8);
        let x = Expr::add(
            Expr::zext(byte_read(&a, 0), INT32),
            Expr::zext(byte_read(&a, 1), INT32),
        );
        let y = Expr::add(
            Expr::zext(byte_read(&a, 0), INT32),
            Expr::zext(byte_read(&a, 1), INT32),
        );
        assert_eq!(x.hash(), y.hash());
        assert!(Rc::ptr_eq(&x, &y));
    }

    #[test]
    fn constant_folding_matches_reference_semantics() {
        let cases: &[(BinaryOp, u64, u64, Width)] = &[
            (BinaryOp::Add, 250, 10, INT8),
            (BinaryOp::Sub, 3, 10, INT8),
            (BinaryOp::Mul, 0x1234, 0x77, INT16),
            (BinaryOp::UDiv, 100, 7, INT32),
            (BinaryOp::UDiv, 100, 0, INT32),
            (BinaryOp::SDiv, 0xffff_fff6, 3, INT32),
            (BinaryOp::URem, 100, 7, INT32),
            (BinaryOp::SRem, 0xffff_fff6, 3, INT32),
            (BinaryOp::Shl, 1, 40, INT32),
            (BinaryOp::LShr, 0x8000_0000, 4, INT32),
            (BinaryOp::AShr, 0x8000_0000, 4, INT32),
        ];
        for &(op, l, r, w) in cases {
            let folded = Expr::binary(
                op,
                Expr::constant_u64(l, w),
                Expr::constant_u64(r, w),
            );
            let expected = op.apply(
                BitVec::new(u128::from(l), w),
                BitVec::new(u128::from(r), w),
            );
            assert_eq!(folded.as_constant(), Some(expected), "{} {} {}", op, l, r);
        }
    }

    #[test]
    fn booleans_stay_canonical() {
        let a = sym_array("btest", 4);
        let x = Expr::zext(byte_read(&a, 0), INT32);
        let y = Expr::zext(byte_read(&a, 1), INT32);

        // Ne and the swapped comparisons never appear.
        let ne = Expr::ne(x.clone(), y.clone());
        match ne.kind() {
            ExprKind::Compare {
                op: CompareOp::Eq,
                left,
                ..
            } => assert!(left.is_false()),
            k => panic!("unexpected kind {:?}", k),
        }
        let ugt = Expr::ugt(x.clone(), y.clone());
        match ugt.kind() {
            ExprKind::Compare {
                op: CompareOp::Ult,
                left,
                right,
            } => {
                assert!(Rc::ptr_eq(left, &y) && Rc::ptr_eq(right, &x));
            }
            k => panic!("unexpected kind {:?}", k),
        }

        // Double negation cancels.
        let cond = Expr::ult(x.clone(), y.clone());
        let neg = Expr::logical_not(cond.clone());
        assert!(Rc::ptr_eq(&Expr::logical_not(neg), &cond));

        // Eq(x, x) folds, select folds to its condition.
        assert!(Expr::eq(x.clone(), x.clone()).is_true());
        let sel = Expr::select(cond.clone(), Expr::bool_const(true), Expr::bool_const(false));
        assert!(Rc::ptr_eq(&sel, &cond));
    }

    #[test]
    fn constants_sit_on_the_left() {
        let a = sym_array("ctest", 4);
        let x = Expr::zext(byte_read(&a, 0), INT32);
        let c = Expr::constant_u64(5, INT32);

        let add = Expr::add(x.clone(), c.clone());
        match add.kind() {
            ExprKind::Binary {
                op: BinaryOp::Add,
                left,
                ..
            } => assert!(left.is_constant()),
            k => panic!("unexpected kind {:?}", k),
        }

        // Subtraction by a constant becomes Add(-c, x).
        let sub = Expr::sub(x.clone(), c.clone());
        match sub.kind() {
            ExprKind::Binary {
                op: BinaryOp::Add,
                left,
                ..
            } => {
                assert_eq!(
                    left.as_constant(),
                    Some(BitVec::new(5u128.wrapping_neg(), INT32))
                );
            }
            k => panic!("unexpected kind {:?}", k),
        }

        // Nested constants collect.
        let twice = Expr::add(Expr::add(c.clone(), x.clone()), Expr::constant_u64(7, INT32));
        match twice.kind() {
            ExprKind::Binary { left, right, .. } => {
                assert_eq!(left.as_constant(), Some(BitVec::new(12, INT32)));
                assert!(Rc::ptr_eq(right, &x));
            }
            k => panic!("unexpected kind {:?}", k),
        }
    }

    #[test]
    fn concat_chains_lean_right() {
        let a = sym_array("cctest", 4);
        let b0 = byte_read(&a, 0);
        let b1 = byte_read(&a, 1);
        let b2 = byte_read(&a, 2);
        let left_leaning = Expr::concat(Expr::concat(b2.clone(), b1.clone()), b0.clone());
        match left_leaning.kind() {
            ExprKind::Concat { left, right } => {
                assert!(Rc::ptr_eq(left, &b2));
                assert!(matches!(right.kind(), ExprKind::Concat { .. }));
            }
            k => panic!("unexpected kind {:?}", k),
        }
        assert_eq!(left_leaning.width(), 24);
    }

    #[test]
    fn extract_of_concat_narrows() {
        let a = sym_array("etest", 4);
        let b0 = byte_read(&a, 0);
        let b1 = byte_read(&a, 1);
        let word = Expr::concat(b1.clone(), b0.clone());
        assert!(Rc::ptr_eq(&Expr::extract(word.clone(), 0, 8), &b0));
        assert!(Rc::ptr_eq(&Expr::extract(word.clone(), 8, 8), &b1));
        // Splitting across the seam re-concatenates the narrow parts.
        let mid = Expr::extract(word, 4, 8);
        assert_eq!(mid.width(), 8);
    }

    #[test]
    fn rebuild_is_identity() {
        let a = sym_array("rtest", 8);
        let e = Expr::ult(
            Expr::add(
                Expr::constant_u64(3, INT32),
                Expr::zext(byte_read(&a, 0), INT32),
            ),
            Expr::zext(byte_read(&a, 1), INT32),
        );
        let rebuilt = e.rebuild(&e.kids());
        assert!(Rc::ptr_eq(&e, &rebuilt));
    }

    #[test]
    fn random_expressions_are_canonical_fixed_points() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let a = sym_array("randtest", 16);
        for _ in 0..200 {
            let e = random_expr(&mut rng, &a, 3);
            if e.is_constant() {
                continue;
            }
            let rebuilt = e.rebuild(&e.kids());
            assert!(
                Rc::ptr_eq(&e, &rebuilt),
                "not a fixed point: {} vs {}",
                e,
                rebuilt
            );
        }
    }

    fn random_expr(rng: &mut StdRng, array: &ArrayRef, depth: u32) -> ExprRef {
        if depth == 0 {
            return if rng.gen_bool(0.5) {
                Expr::constant_u64(rng.gen(), INT32)
            } else {
                Expr::zext(byte_read(array, rng.gen_range(0..16)), INT32)
            };
        }
        let l = random_expr(rng, array, depth - 1);
        let r = random_expr(rng, array, depth - 1);
        match rng.gen_range(0..6) {
            0 => Expr::add(l, r),
            1 => Expr::sub(l, r),
            2 => Expr::mul(l, r),
            3 => Expr::and(l, r),
            4 => Expr::xor(l, r),
            _ => Expr::select(Expr::ult(l.clone(), r.clone()), l, r),
        }
    }

    #[test]
    fn update_lists_shadow_and_share() {
        let a = sym_array("utest", 16);
        let mut ul = UpdateList::new(a.clone(), None);
        let base = Expr::read(ul.clone(), Expr::constant_u64(3, INT32));

        ul.extend(
            Expr::constant_u64(3, INT32),
            Expr::constant_u64(0x7f, INT8),
        );
        let shadowed = Expr::read(ul.clone(), Expr::constant_u64(3, INT32));
        assert_eq!(shadowed.as_constant(), Some(BitVec::new(0x7f, INT8)));

        // A read of a different concrete index skips the unequal update.
        let other = Expr::read(ul.clone(), Expr::constant_u64(4, INT32));
        match other.kind() {
            ExprKind::Read { updates, .. } => assert_eq!(updates.len(), 0),
            k => panic!("unexpected kind {:?}", k),
        }

        // The original read is unaffected by the extension.
        match base.kind() {
            ExprKind::Read { updates, .. } => assert_eq!(updates.len(), 0),
            k => panic!("unexpected kind {:?}", k),
        }
    }

    #[test]
    fn compare_orders_totally() {
        let _guard = CompareCacheGuard::new();
        let a = sym_array("ordtest", 4);
        let x = byte_read(&a, 0);
        let y = byte_read(&a, 1);
        assert_eq!(compare(&x, &x), Ordering::Equal);
        let xy = compare(&x, &y);
        assert_ne!(xy, Ordering::Equal);
        assert_eq!(compare(&y, &x), xy.reverse());
    }
}
