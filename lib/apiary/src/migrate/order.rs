// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::block::VolatilityHandle;

/// Precopy block order for one device.
///
/// The base order is fixed when the blocks are added: coolest blocks (per
/// the volatility monitor) first, index order breaking ties.  `NeedAt`
/// hints promote blocks to a jump queue ahead of the base order, most
/// recent hint first; `DontNeedAt` removes blocks outright.  A block is
/// handed out at most once.
pub struct BlockOrder {
    total: u64,
    inner: Mutex<OrderInner>,
}

struct OrderInner {
    base: VecDeque<u64>,
    promoted: VecDeque<u64>,
    pending: HashSet<u64>,
}

impl BlockOrder {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            inner: Mutex::new(OrderInner {
                base: VecDeque::new(),
                promoted: VecDeque::new(),
                pending: HashSet::new(),
            }),
        }
    }

    /// Total number of blocks this order was sized for.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Adds every block, sorted coolest-first at this instant.  Hints
    /// arriving afterwards adjust the order; heat changes do not.
    pub fn add_all(&self, volatility: &VolatilityHandle) {
        let mut blocks = (0..self.total).collect::<Vec<_>>();
        blocks.sort_by_key(|&b| (volatility.heat(b), b));

        let mut inner = self.inner.lock().unwrap();
        inner.pending = blocks.iter().copied().collect();
        inner.base = blocks.into();
        inner.promoted.clear();
    }

    /// Moves `block` to the head of the order.  A no-op for blocks
    /// already handed out or removed.
    pub fn promote(&self, block: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.contains(&block) {
            inner.promoted.push_front(block);
        }
    }

    /// Drops `block` from the order.
    pub fn remove(&self, block: u64) {
        self.inner.lock().unwrap().pending.remove(&block);
    }

    /// Next block to transfer, if any remain.
    pub fn next(&self) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(b) = inner.promoted.pop_front() {
            if inner.pending.remove(&b) {
                return Some(b);
            }
        }
        while let Some(b) = inner.base.pop_front() {
            if inner.pending.remove(&b) {
                return Some(b);
            }
        }
        None
    }

    /// Blocks not yet handed out.
    pub fn remaining(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}
