//! Slot arenas for block buffers and decoded objects
//!
//! Blocks and objects refer to each other by id rather than by pointer;
//! ownership is tracked with explicit reference counts on the records
//! themselves.

use derive_more::{Display, From, Into};
use slab::Slab;
use std::marker::PhantomData;

/// Handle of a [`crate::BlockRef`] in the block arena
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into)]
#[display("bk#{_0}")]
pub struct BlockId(usize);

/// Handle of a [`crate::Vnode`] in the object arena
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into)]
#[display("vn#{_0}")]
pub struct ObjectId(usize);

/// Typed slab: records of `T` addressed by ids of type `I`
pub struct Arena<I, T> {
    slots: Slab<T>,
    _id: PhantomData<I>,
}

impl<I, T> Arena<I, T>
where
    I: Copy + From<usize> + Into<usize>,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            _id: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> I {
        I::from(self.slots.insert(value))
    }

    #[must_use]
    pub fn get(&self, id: I) -> Option<&T> {
        self.slots.get(id.into())
    }

    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.slots.get_mut(id.into())
    }

    pub fn remove(&mut self, id: I) -> Option<T> {
        self.slots.try_remove(id.into())
    }

    #[must_use]
    pub fn contains(&self, id: I) -> bool {
        self.slots.contains(id.into())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.slots.iter().map(|(key, value)| (I::from(key), value))
    }
}

impl<I, T> Default for Arena<I, T>
where
    I: Copy + From<usize> + Into<usize>,
{
    fn default() -> Self {
        Self::new()
    }
}
