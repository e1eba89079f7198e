/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The conditional additive sum and the type-erased reduction objects
//! that let the aggregator drive heterogeneous reductions uniformly.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;

use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::data::Snapshot;

/// Values a reduction can carry: summable, serializable, and sendable
/// across worker threads. `Default` supplies the value handed to a
/// finalizer when nothing was folded in anywhere.
pub trait ReduceValue:
    std::ops::Add<Output = Self> + Default + Serialize + DeserializeOwned + Send + Sized + 'static
{
}

impl<T> ReduceValue for T where
    T: std::ops::Add<Output = Self> + Default + Serialize + DeserializeOwned + Send + 'static
{
}

/// A sum with an explicit empty state distinct from any zero of `T`.
///
/// Combine rules: Empty ⊕ x = x, x ⊕ Empty = x, Value(a) ⊕ Value(b) =
/// Value(a+b). The empty state absorbs any non-empty partner, so element
/// types need no cheap identity value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum PartialSum<T> {
    /// Nothing has been folded in yet.
    Empty,
    /// The running sum.
    Value(T),
}

impl<T> Default for PartialSum<T> {
    fn default() -> Self {
        PartialSum::Empty
    }
}

impl<T: std::ops::Add<Output = T>> PartialSum<T> {
    /// Fold a raw value into the sum.
    pub fn add(&mut self, value: T) {
        *self = match std::mem::take(self) {
            PartialSum::Empty => PartialSum::Value(value),
            PartialSum::Value(current) => PartialSum::Value(current + value),
        };
    }

    /// Combine another sum into this one.
    pub fn merge(&mut self, other: PartialSum<T>) {
        if let PartialSum::Value(value) = other {
            self.add(value);
        }
    }

    /// Reset to the empty state.
    pub fn clear(&mut self) {
        *self = PartialSum::Empty;
    }
}

/// A type-erased reduction: kind tag, map, finalize, and a lock-guarded
/// [`PartialSum`], driven by the aggregator with no knowledge of the
/// element type.
///
/// `merge_*` and `overwrite_*` are mutually exclusive through the internal
/// mutex; the `map_*` calls are made only on thread-private clones, where
/// the mutex is uncontended.
pub trait ErasedReduction<C, V, E>: Send + Sync {
    /// A new reduction with the same kind, map, and finalize, but an
    /// empty sum.
    fn clone_empty(&self) -> Box<dyn ErasedReduction<C, V, E>>;

    /// Apply the map function to a vertex and fold the result into the
    /// sum. Panics if this is an edge reduction.
    fn map_vertex(&self, context: &C, vertex: &V);

    /// Apply the map function to an edge and fold the result into the
    /// sum. Panics if this is a vertex reduction.
    fn map_edge(&self, context: &C, edge: &E);

    /// Whether the reduction scans vertices rather than edges.
    fn is_vertex_kind(&self) -> bool;

    /// A serialized copy of the current sum.
    fn export_value(&self) -> anyhow::Result<Snapshot>;

    /// Combine a serialized sum into this one.
    fn merge_serialized(&self, other: &Snapshot) -> anyhow::Result<()>;

    /// Replace the sum with a serialized one.
    fn overwrite_serialized(&self, other: &Snapshot) -> anyhow::Result<()>;

    /// Combine another reduction of the same concrete type into this one,
    /// draining the other's sum. Panics if the concrete types differ.
    fn merge_from(&self, other: &dyn ErasedReduction<C, V, E>);

    /// Reset the sum to empty.
    fn clear(&self);

    /// Invoke the user finalizer against the current sum.
    fn finalize(&self, context: &C);

    /// Type-erased self access, for same-type merging.
    fn as_any(&self) -> &dyn Any;
}

enum MapFn<T, C, V, E> {
    Vertex(Arc<dyn Fn(&C, &V) -> T + Send + Sync>),
    Edge(Arc<dyn Fn(&C, &E) -> T + Send + Sync>),
}

impl<T, C, V, E> Clone for MapFn<T, C, V, E> {
    fn clone(&self) -> Self {
        match self {
            MapFn::Vertex(map) => MapFn::Vertex(Arc::clone(map)),
            MapFn::Edge(map) => MapFn::Edge(Arc::clone(map)),
        }
    }
}

/// The typed implementation of [`ErasedReduction`]: a map function over
/// vertices or edges whose `T`-typed results are summed, and a finalizer
/// invoked against the combined sum.
pub struct Reduction<T, C, V, E> {
    map: MapFn<T, C, V, E>,
    finalize: Arc<dyn Fn(&C, &T) + Send + Sync>,
    sum: Mutex<PartialSum<T>>,
}

impl<T, C, V, E> Reduction<T, C, V, E> {
    /// Construct a vertex reduction.
    pub fn vertex(
        map: impl Fn(&C, &V) -> T + Send + Sync + 'static,
        finalize: impl Fn(&C, &T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            map: MapFn::Vertex(Arc::new(map)),
            finalize: Arc::new(finalize),
            sum: Mutex::new(PartialSum::Empty),
        }
    }

    /// Construct an edge reduction.
    pub fn edge(
        map: impl Fn(&C, &E) -> T + Send + Sync + 'static,
        finalize: impl Fn(&C, &T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            map: MapFn::Edge(Arc::new(map)),
            finalize: Arc::new(finalize),
            sum: Mutex::new(PartialSum::Empty),
        }
    }
}

impl<T, C, V, E> ErasedReduction<C, V, E> for Reduction<T, C, V, E>
where
    T: ReduceValue,
    C: 'static,
    V: 'static,
    E: 'static,
{
    fn clone_empty(&self) -> Box<dyn ErasedReduction<C, V, E>> {
        Box::new(Reduction {
            map: self.map.clone(),
            finalize: Arc::clone(&self.finalize),
            sum: Mutex::new(PartialSum::Empty),
        })
    }

    fn map_vertex(&self, context: &C, vertex: &V) {
        let MapFn::Vertex(map) = &self.map else {
            panic!("vertex map invoked on an edge reduction");
        };
        let value = map(context, vertex);
        self.sum.lock().unwrap().add(value);
    }

    fn map_edge(&self, context: &C, edge: &E) {
        let MapFn::Edge(map) = &self.map else {
            panic!("edge map invoked on a vertex reduction");
        };
        let value = map(context, edge);
        self.sum.lock().unwrap().add(value);
    }

    fn is_vertex_kind(&self) -> bool {
        matches!(self.map, MapFn::Vertex(_))
    }

    fn export_value(&self) -> anyhow::Result<Snapshot> {
        let sum = self.sum.lock().unwrap();
        Ok(Snapshot::serialize(&*sum)?)
    }

    fn merge_serialized(&self, other: &Snapshot) -> anyhow::Result<()> {
        let other: PartialSum<T> = other.deserialized()?;
        self.sum.lock().unwrap().merge(other);
        Ok(())
    }

    fn overwrite_serialized(&self, other: &Snapshot) -> anyhow::Result<()> {
        let other: PartialSum<T> = other.deserialized()?;
        *self.sum.lock().unwrap() = other;
        Ok(())
    }

    fn merge_from(&self, other: &dyn ErasedReduction<C, V, E>) {
        let other = other
            .as_any()
            .downcast_ref::<Reduction<T, C, V, E>>()
            .expect("merged reductions must share a concrete element type");
        let taken = std::mem::take(&mut *other.sum.lock().unwrap());
        self.sum.lock().unwrap().merge(taken);
    }

    fn clear(&self) {
        self.sum.lock().unwrap().clear();
    }

    fn finalize(&self, context: &C) {
        let sum = self.sum.lock().unwrap();
        match &*sum {
            PartialSum::Value(value) => (self.finalize)(context, value),
            PartialSum::Empty => (self.finalize)(context, &T::default()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_partial_sum_combine_rules() {
        let mut sum: PartialSum<i64> = PartialSum::Empty;
        assert_eq!(sum.as_value(), None);

        // Empty absorbs into a value.
        sum.add(3);
        assert_eq!(sum, PartialSum::Value(3));
        sum.add(4);
        assert_eq!(sum.as_value(), Some(&7));

        // Merging an empty partner is a no-op.
        sum.merge(PartialSum::Empty);
        assert_eq!(sum, PartialSum::Value(7));
        sum.merge(PartialSum::Value(5));
        assert_eq!(sum, PartialSum::Value(12));

        sum.clear();
        assert_eq!(sum, PartialSum::Empty);
        sum.merge(PartialSum::Value(9));
        assert_eq!(sum, PartialSum::Value(9));
    }

    type VertexFixture = (usize, i64);

    fn counting_reduction() -> Reduction<i64, (), VertexFixture, ()> {
        Reduction::vertex(|_, vertex: &VertexFixture| vertex.1, |_, _| {})
    }

    #[test]
    fn test_map_and_merge() {
        let root = counting_reduction();
        let shard = root.clone_empty();
        assert!(shard.is_vertex_kind());

        shard.map_vertex(&(), &(0, 10));
        shard.map_vertex(&(), &(1, 20));
        root.merge_from(shard.as_ref());

        let exported: PartialSum<i64> = root.export_value().unwrap().deserialized().unwrap();
        assert_eq!(exported, PartialSum::Value(30));

        // merge_from drains its argument.
        let drained: PartialSum<i64> = shard.export_value().unwrap().deserialized().unwrap();
        assert_eq!(drained, PartialSum::Empty);
    }

    #[test]
    fn test_serialized_merge_and_overwrite() {
        let left = counting_reduction();
        left.map_vertex(&(), &(0, 5));
        let right = counting_reduction();
        right.map_vertex(&(), &(1, 7));

        left.merge_serialized(&right.export_value().unwrap()).unwrap();
        let merged: PartialSum<i64> = left.export_value().unwrap().deserialized().unwrap();
        assert_eq!(merged, PartialSum::Value(12));

        left.overwrite_serialized(&right.export_value().unwrap())
            .unwrap();
        let overwritten: PartialSum<i64> = left.export_value().unwrap().deserialized().unwrap();
        assert_eq!(overwritten, PartialSum::Value(7));
    }

    #[test]
    fn test_finalize_empty_sum_sees_default() {
        let observed = Mutex::new(None);
        let reduction: Reduction<i64, Mutex<Option<i64>>, VertexFixture, ()> =
            Reduction::vertex(
                |_, vertex: &VertexFixture| vertex.1,
                |out: &Mutex<Option<i64>>, total: &i64| *out.lock().unwrap() = Some(*total),
            );
        reduction.finalize(&observed);
        assert_eq!(*observed.lock().unwrap(), Some(0));
    }

    #[test]
    #[should_panic(expected = "edge map invoked on a vertex reduction")]
    fn test_kind_mismatch_is_fatal() {
        let reduction = counting_reduction();
        reduction.map_edge(&(), &());
    }
}
