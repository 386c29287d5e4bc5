//! Memory objects and their per-path byte states.
//!
//! An `ObjectState` starts fully concrete. The first symbolic write or the
//! first access through a symbolic index promotes it: the current bytes
//! become a constant array and subsequent writes extend its update list.
//! Per-byte expression caches keep constant-index traffic off the chain.

use crate::expr::{
    ArrayRef, BitVec, Expr, ExprContext, ExprRef, InstTag, UpdateList, INT32, INT8,
};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

pub type MemoryObjectRef = Rc<MemoryObject>;

pub struct MemoryObject {
    pub id: u64,
    pub address: u64,
    pub size: u64,
    pub name: String,
    pub is_local: bool,
    pub is_global: bool,
    pub site: Option<InstTag>,
    read_only: Cell<bool>,
}

impl MemoryObject {
    pub fn new(
        id: u64,
        address: u64,
        size: u64,
        name: String,
        is_local: bool,
        is_global: bool,
        site: Option<InstTag>,
    ) -> Self {
        Self {
            id,
            address,
            size,
            name,
            is_local,
            is_global,
            site,
            read_only: Cell::new(false),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.get()
    }

    pub fn set_read_only(&self, value: bool) {
        self.read_only.set(value);
    }

    pub fn base_expr(&self) -> ExprRef {
        Expr::pointer(self.address)
    }

    /// `address - base`, canonicalized to `Add(-base, address)`.
    pub fn offset_of(&self, address: ExprRef) -> ExprRef {
        Expr::sub(address, self.base_expr())
    }

    /// True iff `offset + bytes <= size`, exploiting wrap-around so a
    /// single unsigned comparison suffices.
    pub fn bounds_check_offset(&self, offset: ExprRef, bytes: u64) -> ExprRef {
        if self.size < bytes {
            return Expr::bool_const(false);
        }
        Expr::ult(
            offset,
            Expr::pointer(self.size - bytes + 1),
        )
    }

    pub fn bounds_check_pointer(&self, address: ExprRef, bytes: u64) -> ExprRef {
        self.bounds_check_offset(self.offset_of(address), bytes)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size.max(1)
    }
}

impl fmt::Display for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}@{:#x}[{}]{}",
            self.name,
            self.address,
            self.size,
            if self.is_local { " local" } else { "" }
        )
    }
}

#[derive(Clone)]
pub struct ObjectState {
    object: MemoryObjectRef,
    concrete: Vec<u8>,
    /// Expression cache per byte, authoritative while `unflushed`.
    known: Vec<Option<ExprRef>>,
    /// Bytes whose latest value is not yet reflected in the update list.
    unflushed: Vec<bool>,
    updates: Option<UpdateList>,
    /// Last writer per byte.
    writers: Vec<Option<InstTag>>,
}

impl ObjectState {
    pub fn concrete(object: MemoryObjectRef, init: &[u8]) -> Self {
        let size = object.size as usize;
        let mut bytes = init.to_vec();
        bytes.resize(size, 0);
        Self {
            object,
            concrete: bytes,
            known: vec![None; size],
            unflushed: vec![false; size],
            updates: None,
            writers: vec![None; size],
        }
    }

    pub fn zeroed(object: MemoryObjectRef) -> Self {
        Self::concrete(object, &[])
    }

    /// A fresh fully-symbolic state whose bytes read from `array`.
    pub fn from_array(object: MemoryObjectRef, array: ArrayRef) -> Self {
        let size = object.size as usize;
        debug_assert_eq!(array.size() as usize, size);
        Self {
            object,
            concrete: vec![0; size],
            known: vec![None; size],
            unflushed: vec![false; size],
            updates: Some(UpdateList::new(array, None)),
            writers: vec![None; size],
        }
    }

    pub fn object(&self) -> &MemoryObjectRef {
        &self.object
    }

    pub fn last_writer(&self, offset: u64) -> Option<InstTag> {
        self.writers[offset as usize]
    }

    /// True once any byte depends on symbolic data.
    pub fn is_symbolic(&self) -> bool {
        self.updates.is_some()
    }

    fn promote(&mut self) {
        if self.updates.is_some() {
            return;
        }
        let name = format!("{}_v{}", self.object.name, self.object.id);
        let array =
            ExprContext::with(|cx| cx.arrays.constant_bytes(&name, &self.concrete));
        self.updates = Some(UpdateList::new(array, None));
    }

    /// Writes every unflushed byte into the update list so symbolic-index
    /// accesses observe the complete history.
    fn flush(&mut self) {
        self.promote();
        let updates = self.updates.as_mut().unwrap();
        for i in 0..self.concrete.len() {
            if !self.unflushed[i] {
                continue;
            }
            let value = match &self.known[i] {
                Some(e) => e.clone(),
                None => Expr::constant(BitVec::new(u128::from(self.concrete[i]), INT8)),
            };
            updates.extend(Expr::constant_u64(i as u64, INT32), value);
            self.unflushed[i] = false;
        }
    }

    pub fn read8(&self, offset: u64) -> ExprRef {
        let i = offset as usize;
        if let Some(e) = &self.known[i] {
            return e.clone();
        }
        match &self.updates {
            Some(updates) if !self.unflushed[i] => {
                Expr::read(updates.clone(), Expr::constant_u64(offset, INT32))
            }
            _ => Expr::constant(BitVec::new(u128::from(self.concrete[i]), INT8)),
        }
    }

    pub fn write8(&mut self, offset: u64, value: ExprRef, tag: Option<InstTag>) {
        debug_assert_eq!(value.width(), INT8);
        let i = offset as usize;
        self.writers[i] = tag;
        if self.updates.is_none() {
            if let Some(v) = value.as_constant() {
                self.concrete[i] = v.as_u64() as u8;
                self.known[i] = None;
                return;
            }
            self.promote();
        }
        self.known[i] = Some(value);
        self.unflushed[i] = true;
    }

    /// Little-endian read of `width` bits at a concrete byte offset.
    pub fn read(&self, offset: u64, width: u32) -> ExprRef {
        if width == 1 {
            return Expr::extract(self.read8(offset), 0, 1);
        }
        debug_assert_eq!(width % 8, 0);
        let bytes = u64::from(width / 8);
        let mut result = self.read8(offset);
        for i in 1..bytes {
            result = Expr::concat(self.read8(offset + i), result);
        }
        result
    }

    /// Little-endian write of `value` at a concrete byte offset.
    pub fn write(&mut self, offset: u64, value: ExprRef, tag: Option<InstTag>) {
        let value = if value.width() == 1 {
            Expr::zext(value, 8)
        } else {
            value
        };
        debug_assert_eq!(value.width() % 8, 0);
        let bytes = u64::from(value.width() / 8);
        for i in 0..bytes {
            self.write8(
                offset + i,
                Expr::extract(value.clone(), (i as u32) * 8, 8),
                tag,
            );
        }
    }

    /// Read at a symbolic byte offset. Flushes the byte caches first so
    /// the update list carries the full history.
    pub fn read_symbolic(&mut self, offset: ExprRef, width: u32) -> ExprRef {
        self.flush();
        let index = to_index_width(offset);
        let updates = self.updates.as_ref().unwrap().clone();
        let read_at = |delta: u64| {
            let shifted = if delta == 0 {
                index.clone()
            } else {
                Expr::add(Expr::constant_u64(delta, INT32), index.clone())
            };
            Expr::read(updates.clone(), shifted)
        };
        if width == 1 {
            return Expr::extract(read_at(0), 0, 1);
        }
        debug_assert_eq!(width % 8, 0);
        let bytes = u64::from(width / 8);
        let mut result = read_at(0);
        for i in 1..bytes {
            result = Expr::concat(read_at(i), result);
        }
        result
    }

    /// Write at a symbolic byte offset. Every byte cache is invalidated:
    /// after this, reads flow through the update list.
    pub fn write_symbolic(&mut self, offset: ExprRef, value: ExprRef, tag: Option<InstTag>) {
        self.flush();
        let value = if value.width() == 1 {
            Expr::zext(value, 8)
        } else {
            value
        };
        debug_assert_eq!(value.width() % 8, 0);
        let index = to_index_width(offset);
        let bytes = u64::from(value.width() / 8);
        let updates = self.updates.as_mut().unwrap();
        for i in 0..bytes {
            let shifted = if i == 0 {
                index.clone()
            } else {
                Expr::add(Expr::constant_u64(i, INT32), index.clone())
            };
            updates.extend(shifted, Expr::extract(value.clone(), (i as u32) * 8, 8));
        }
        for i in 0..self.concrete.len() {
            self.known[i] = None;
            self.unflushed[i] = false;
            self.writers[i] = tag;
        }
    }
}

/// Offsets computed in pointer width address a 32-bit array domain.
fn to_index_width(offset: ExprRef) -> ExprRef {
    match offset.width() {
        INT32 => offset,
        w if w > INT32 => Expr::extract(offset, 0, INT32),
        _ => Expr::zext(offset, INT32),
    }
}

impl fmt::Debug for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ObjectState({}, {})",
            self.object,
            if self.is_symbolic() {
                "symbolic"
            } else {
                "concrete"
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Assignment;

    fn object(size: u64) -> MemoryObjectRef {
        Rc::new(MemoryObject::new(
            900 + size,
            0x5000,
            size,
            "obj".into(),
            false,
            false,
            None,
        ))
    }

    #[test]
    fn concrete_round_trip() {
        let mut os = ObjectState::zeroed(object(8));
        os.write(0, Expr::constant_u64(0x1122334455667788, 64), None);
        assert_eq!(
            os.read(0, 64).as_constant().map(|v| v.as_u64()),
            Some(0x1122334455667788)
        );
        assert_eq!(
            os.read(2, 16).as_constant().map(|v| v.as_u64()),
            Some(0x5566)
        );
        assert!(!os.is_symbolic());
    }

    #[test]
    fn promotion_preserves_bytes() {
        let array = ExprContext::with(|cx| cx.arrays.symbolic("os_prom", 1));
        let sym = Expr::read(
            UpdateList::new(array, None),
            Expr::constant_u64(0, INT32),
        );
        let mut os = ObjectState::zeroed(object(4));
        os.write(0, Expr::constant_u64(0xaabbccdd, 32), None);
        os.write8(1, sym.clone(), None);
        assert!(os.is_symbolic());
        // Unwritten bytes still read their concrete values.
        assert_eq!(os.read8(0).as_constant().map(|v| v.as_u64()), Some(0xdd));
        assert_eq!(os.read8(3).as_constant().map(|v| v.as_u64()), Some(0xaa));
        assert!(os.read8(1).as_constant().is_none());
    }

    #[test]
    fn symbolic_index_sees_flushed_history() {
        let idx_array = ExprContext::with(|cx| cx.arrays.symbolic("os_idx", 1));
        let idx = Expr::zext(
            Expr::read(
                UpdateList::new(idx_array.clone(), None),
                Expr::constant_u64(0, INT32),
            ),
            INT32,
        );
        let mut os = ObjectState::zeroed(object(4));
        os.write(0, Expr::constant_u64(0x0403_0201, 32), None);
        let loaded = os.read_symbolic(idx, 8);

        // Under idx = 2 the read must observe byte 2.
        let mut assignment = Assignment::new(true);
        assignment.bind(&idx_array, vec![2]);
        assert_eq!(assignment.evaluate(&loaded).map(|v| v.as_u64()), Some(3));
    }
}
