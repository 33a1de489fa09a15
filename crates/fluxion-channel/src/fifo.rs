use std::collections::VecDeque;

use slab::Slab;

/// A FIFO (with LIFO-friendly `pop_back`) that stores values in a slab and
/// tracks admission order as a separate list of slab keys.
///
/// This is the language-neutral equivalent of an intrusive doubly-linked
/// list of arena-allocated nodes: membership is a stable integer handle
/// rather than a pointer, and both ends are O(1) with no per-push heap
/// allocation beyond the slab's own amortized growth.
pub(crate) struct Fifo<T> {
    slab: Slab<T>,
    order: VecDeque<usize>,
}

impl<T> Fifo<T> {
    pub(crate) fn new() -> Self {
        Fifo {
            slab: Slab::new(),
            order: VecDeque::new(),
        }
    }

    pub(crate) fn push_back(&mut self, value: T) {
        let key = self.slab.insert(value);
        self.order.push_back(key);
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        let key = self.order.pop_front()?;
        Some(self.slab.remove(key))
    }

    /// Removes the most recently admitted entry. Used by `close_send`'s
    /// LIFO rejection of trailing receivers.
    pub(crate) fn pop_back(&mut self) -> Option<T> {
        let key = self.order.pop_back()?;
        Some(self.slab.remove(key))
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<T> {
        let keys: Vec<usize> = self.order.drain(..).collect();
        keys.into_iter().map(|key| self.slab.remove(key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let mut f = Fifo::new();
        f.push_back(1);
        f.push_back(2);
        f.push_back(3);
        assert_eq!(f.pop_front(), Some(1));
        assert_eq!(f.pop_back(), Some(3));
        assert_eq!(f.pop_front(), Some(2));
        assert_eq!(f.pop_front(), None);
    }
}
