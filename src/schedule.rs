/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Min-priority schedule of (key, next fire time) pairs. Fire times are
//! offsets from the aggregation epoch established by `start()`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct Schedule {
    heap: BinaryHeap<Reverse<(Duration, String)>>,
}

impl Schedule {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, key: String, fire_at: Duration) {
        self.heap.push(Reverse((fire_at, key)));
    }

    /// The earliest entry, without removing it.
    pub(crate) fn peek(&self) -> Option<(Duration, &str)> {
        self.heap
            .peek()
            .map(|Reverse((fire_at, key))| (*fire_at, key.as_str()))
    }

    /// Remove and return the earliest entry.
    pub(crate) fn pop(&mut self) -> Option<(Duration, String)> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
