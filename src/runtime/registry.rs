//! Generational slot arena keyed by opaque handles.
//!
//! A handle packs a namespace bit, a 31-bit generation and a 1-based slot
//! index, so it is never zero and a freed handle never resolves to a later
//! occupant of the same slot.

use serde::Serialize;
use std::fmt;
use std::num::NonZeroU64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Handle(NonZeroU64);

impl Handle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }

    fn pack(namespace: Namespace, generation: u32, index: usize) -> Option<Self> {
        let slot = u32::try_from(index + 1).ok()? as u64;
        let raw = (namespace as u64) << 63 | ((generation & GENERATION_MASK) as u64) << 32 | slot;
        Self::from_raw(raw)
    }

    fn unpack(self) -> (u64, u32, usize) {
        let raw = self.raw();
        let namespace = raw >> 63;
        let generation = ((raw >> 32) as u32) & GENERATION_MASK;
        let slot = (raw & 0xFFFF_FFFF) as usize;
        (namespace, generation, slot.wrapping_sub(1))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.raw())
    }
}

const GENERATION_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Model = 0,
    Session = 1,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<usize> },
}

#[derive(Debug)]
pub struct Registry<T> {
    namespace: Namespace,
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
}

impl<T> Registry<T> {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Returns `None` only when the slot space is exhausted.
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        match self.free_head {
            Some(index) => {
                let generation = match self.slots[index] {
                    Slot::Vacant { generation, next_free } => {
                        self.free_head = next_free;
                        generation
                    }
                    Slot::Occupied { .. } => return None,
                };
                self.slots[index] = Slot::Occupied { generation, value };
                self.len += 1;
                Handle::pack(self.namespace, generation, index)
            }
            None => {
                let index = self.slots.len();
                let handle = Handle::pack(self.namespace, 0, index)?;
                self.slots.push(Slot::Occupied { generation: 0, value });
                self.len += 1;
                Some(handle)
            }
        }
    }

    fn locate(&self, handle: Handle) -> Option<usize> {
        let (namespace, generation, index) = handle.unpack();
        if namespace != self.namespace as u64 {
            return None;
        }
        match self.slots.get(index)? {
            Slot::Occupied { generation: g, .. } if *g == generation => Some(index),
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.locate(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match &self.slots[self.locate(handle)?] {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let index = self.locate(handle)?;
        match &mut self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.locate(handle)?;
        let (_, generation, _) = handle.unpack();
        let vacant = Slot::Vacant {
            generation: generation.wrapping_add(1) & GENERATION_MASK,
            next_free: self.free_head,
        };
        match std::mem::replace(&mut self.slots[index], vacant) {
            Slot::Occupied { value, .. } => {
                self.free_head = Some(index);
                self.len -= 1;
                Some(value)
            }
            Slot::Vacant { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        let namespace = self.namespace;
        self.slots.iter().enumerate().filter_map(move |(i, slot)| match slot {
            Slot::Occupied { generation, value } => {
                Handle::pack(namespace, *generation, i).map(|h| (h, value))
            }
            Slot::Vacant { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        let namespace = self.namespace;
        self.slots.iter_mut().enumerate().filter_map(move |(i, slot)| match slot {
            Slot::Occupied { generation, value } => {
                Handle::pack(namespace, *generation, i).map(|h| (h, value))
            }
            Slot::Vacant { .. } => None,
        })
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }
}
