//! The address space and the allocator behind it.
//!
//! Object states are copy-on-write: forked states share bindings through a
//! path-copying ordered map until a write forces a per-path clone of the
//! touched object.

pub mod object;

pub use object::{MemoryObject, MemoryObjectRef, ObjectState};

use crate::expr::InstTag;
use crate::stats;
use imbl::OrdMap;
use log::trace;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Object ids are process-wide so every path names an allocation the same
/// way in logs and test cases.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

const HEAP_BASE: u64 = 0x1000_0000;
const GUARD_GAP: u64 = 16;

pub struct MemoryManager {
    next_address: u64,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            next_address: HEAP_BASE,
        }
    }

    pub fn allocate(
        &mut self,
        size: u64,
        is_local: bool,
        is_global: bool,
        name: &str,
        alignment: u64,
        site: Option<InstTag>,
    ) -> MemoryObjectRef {
        let alignment = alignment.max(1).next_power_of_two();
        let address = (self.next_address + alignment - 1) & !(alignment - 1);
        self.next_address = address + size.max(1) + GUARD_GAP;
        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        stats::ALLOCATED_BYTES.add(size);
        let object = Rc::new(MemoryObject::new(
            id, address, size, name.to_owned(), is_local, is_global, site,
        ));
        trace!("allocate {}", object);
        object
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Binding {
    pub object: MemoryObjectRef,
    pub state: Rc<ObjectState>,
}

#[derive(Clone, Default)]
pub struct AddressSpace {
    map: OrdMap<u64, Binding>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, object: MemoryObjectRef, state: ObjectState) {
        self.map.insert(
            object.address,
            Binding {
                object,
                state: Rc::new(state),
            },
        );
    }

    pub fn unbind(&mut self, object: &MemoryObjectRef) {
        self.map.remove(&object.address);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The binding containing a concrete address, if any.
    pub fn find(&self, address: u64) -> Option<&Binding> {
        let (_, binding) = self.map.get_prev(&address)?;
        if binding.object.contains(address) {
            Some(binding)
        } else {
            None
        }
    }

    pub fn binding_at(&self, base: u64) -> Option<&Binding> {
        self.map.get(&base)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.map.values()
    }

    /// The writable object state for a bound object: in place when this
    /// path owns it alone, cloned first otherwise.
    pub fn get_writable(&mut self, base: u64) -> Option<&mut ObjectState> {
        let binding = self.map.get_mut(&base)?;
        Some(Rc::make_mut(&mut binding.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn copy_on_write_isolates_forks() {
        let mut mm = MemoryManager::new();
        let object = mm.allocate(4, false, false, "cow", 8, None);
        let mut parent = AddressSpace::new();
        parent.bind(object.clone(), ObjectState::zeroed(object.clone()));

        let mut child = parent.clone();
        child
            .get_writable(object.address)
            .unwrap()
            .write(0, Expr::constant_u64(0xdead_beef, 32), None);

        let child_view = child.find(object.address).unwrap();
        let parent_view = parent.find(object.address).unwrap();
        assert_eq!(
            child_view.state.read(0, 32).as_constant().map(|v| v.as_u64()),
            Some(0xdead_beef)
        );
        assert_eq!(
            parent_view.state.read(0, 32).as_constant().map(|v| v.as_u64()),
            Some(0)
        );
    }

    #[test]
    fn find_respects_bounds() {
        let mut mm = MemoryManager::new();
        let a = mm.allocate(8, false, false, "a", 8, None);
        let b = mm.allocate(8, false, false, "b", 8, None);
        let mut space = AddressSpace::new();
        space.bind(a.clone(), ObjectState::zeroed(a.clone()));
        space.bind(b.clone(), ObjectState::zeroed(b.clone()));

        assert!(space.find(a.address + 7).is_some());
        assert!(space.find(a.address + 8).is_none());
        assert_eq!(space.find(b.address).unwrap().object.id, b.id);
    }
}
