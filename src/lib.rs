/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mapfold is a distributed aggregation service for partitioned graph
//! engines: named map-reduce-finalize pipelines over the vertices or
//! edges of a graph spread across machines.
//!
//! Each machine registers the same reductions against its own
//! [`Aggregator`]; a reduction carries a per-element map function, a
//! summable result type, and a finalizer. Aggregations then run in two
//! phases:
//!
//! * a thread-parallel fold over the locally owned shard (ghost replicas
//!   are filtered out of vertex scans; edge scans walk in-edges, which
//!   are canonically stored exactly once cluster-wide), and
//! * a global combine: gather per-machine sums on the coordinator
//!   (machine 0), fold, and broadcast, so the user finalizer observes
//!   the identical combined sum on every machine.
//!
//! Reductions can be aggregated on demand ([`Aggregator::aggregate_now`],
//! a collective), or periodically during engine execution through one of
//! two mutually exclusive tick drivers: the lockstep
//! [`Aggregator::tick_sync`], or the non-blocking
//! [`Aggregator::tick_async`] / [`Aggregator::tick_async_compute`] pair
//! driven by the engine's worker pool, which coordinates overlapping
//! aggregations through distributed countdowns.
//!
//! The graph, the peer-to-peer substrate, and the clock are supplied by
//! the host engine through the [`GraphShard`], [`Cluster`], and
//! [`clock::Clock`] traits; [`comm::local`] provides a complete
//! in-process mesh for tests and single-process runs.

#![deny(missing_docs)]

pub mod accum;
pub mod aggregator;
pub mod clock;
pub mod comm;
pub mod data;
pub mod graph;
mod schedule;
/// Test utilities.
pub mod test_utils;

pub use accum::PartialSum;
pub use aggregator::Aggregator;
pub use clock::ClockKind;
pub use clock::RealClock;
pub use clock::SimClock;
pub use comm::Cluster;
pub use comm::MachineId;
pub use comm::PeerMessage;
pub use data::Snapshot;
pub use graph::GraphShard;
