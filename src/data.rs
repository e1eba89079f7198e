/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Transport-ready copies of reduction sums.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// The type of error returned by operations on [`Snapshot`].
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Errors returned from serde bincode.
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

/// A serialized, transport-ready copy of a reduction sum.
///
/// Snapshots carry a sum across machines without the transport layer
/// needing any knowledge of the underlying element type. Currently the
/// encoding passes through to bincode; the payload is opaque to everything
/// but the reduction that produced it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    data: Bytes,
}

impl Snapshot {
    /// Construct a new snapshot by serializing the provided value.
    pub fn serialize<T: Serialize>(value: &T) -> Result<Self, SnapshotError> {
        Ok(Self {
            data: bincode::serialize(value)?.into(),
        })
    }

    /// Deserialize the snapshot into the provided type.
    pub fn deserialized<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        Ok(bincode::deserialize(&self.data)?)
    }

    /// The length of the encoded payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the encoded payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_carries_value() {
        let snapshot = Snapshot::serialize(&(42u64, "total".to_string())).unwrap();
        assert!(!snapshot.is_empty());
        let (count, label): (u64, String) = snapshot.deserialized().unwrap();
        assert_eq!(count, 42);
        assert_eq!(label, "total");
    }
}
