/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Contexts that capture the values delivered to finalizers.

use std::sync::Mutex;

/// Captures every value a finalizer delivers, in order.
#[derive(Debug, Default)]
pub struct Capture<T> {
    values: Mutex<Vec<T>>,
}

impl<T: Clone> Capture<T> {
    /// Create an empty capture.
    pub fn new() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
        }
    }

    /// Record a delivered value.
    pub fn push(&self, value: T) {
        self.values.lock().unwrap().push(value);
    }

    /// All recorded values, in delivery order.
    pub fn values(&self) -> Vec<T> {
        self.values.lock().unwrap().clone()
    }

    /// The number of deliveries recorded so far.
    pub fn count(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    /// The most recent delivery, if any.
    pub fn last(&self) -> Option<T> {
        self.values.lock().unwrap().last().cloned()
    }
}
