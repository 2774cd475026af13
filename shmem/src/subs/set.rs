use std::ops::{Index, IndexMut};

/// Unordered collection that fills the hole left by a removal with its last
/// element, keeping storage dense.
#[derive(Debug)]
pub struct SwapSet<T> {
    items: Vec<T>,
}

impl<T> Default for SwapSet<T> {
    fn default() -> Self {
        SwapSet { items: Vec::new() }
    }
}

impl<T> SwapSet<T> {
    pub fn new() -> SwapSet<T> {
        SwapSet::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the index of the new item.
    pub fn push(&mut self, item: T) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    pub fn position<P: FnMut(&T) -> bool>(&self, pred: P) -> Option<usize> {
        self.items.iter().position(pred)
    }

    pub fn find<P: FnMut(&&T) -> bool>(&self, pred: P) -> Option<&T> {
        self.items.iter().find(pred)
    }

    pub fn swap_remove(&mut self, idx: usize) -> T {
        self.items.swap_remove(idx)
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }
}

impl<T> Index<usize> for SwapSet<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &T {
        &self.items[idx]
    }
}

impl<T> IndexMut<usize> for SwapSet<T> {
    fn index_mut(&mut self, idx: usize) -> &mut T {
        &mut self.items[idx]
    }
}
