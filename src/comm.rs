/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The RPC collaborator interface: peer identity, collectives, and the
//! one-way messages the aggregators exchange.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::data::Snapshot;

pub mod local;

/// Identifies a machine participating in the engine run.
pub type MachineId = usize;

/// The machine that performs global combines and drives rescheduling.
pub const COORDINATOR: MachineId = 0;

/// One-way messages exchanged between the aggregators on different
/// machines during asynchronous aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// A machine finished its local fold; the coordinator merges its
    /// snapshot into the root sum.
    MergeSum {
        /// The reduction being aggregated.
        key: String,
        /// The sending machine's combined local sum.
        snapshot: Snapshot,
    },
    /// The coordinator directs a machine to finalize against the combined
    /// sum.
    PerformFinalize {
        /// The reduction being aggregated.
        key: String,
        /// The cluster-wide combined sum.
        snapshot: Snapshot,
    },
    /// A machine finished finalizing.
    FinalizeDone {
        /// The reduction being aggregated.
        key: String,
    },
    /// Re-arm the local schedule for a key.
    ScheduleKey {
        /// The reduction to re-arm.
        key: String,
        /// The next fire time, as an offset from the aggregation epoch.
        fire_at: Duration,
    },
}

/// The peer-to-peer substrate required from the host engine.
///
/// The collectives (`barrier`, `gather`, `broadcast`) must be entered by
/// exactly one thread per machine, in the same order on every machine.
/// `remote_call` is one-way and best-effort-reliable; delivered messages
/// are handed to the receiving machine's message handler.
pub trait Cluster: Send + Sync + 'static {
    /// This machine's identity.
    fn machine(&self) -> MachineId;

    /// The number of participating machines.
    fn num_machines(&self) -> usize;

    /// Block until every machine has entered the barrier.
    fn barrier(&self);

    /// Collective: every machine contributes a snapshot; the coordinator
    /// receives `Some` with one snapshot per machine, indexed by machine
    /// id, and every other machine receives `None`.
    fn gather(&self, snapshot: Snapshot) -> Option<Vec<Snapshot>>;

    /// Collective: the coordinator passes `Some(value)`, every other
    /// machine passes `None`; all machines return the coordinator's value.
    fn broadcast<T: Serialize + DeserializeOwned>(&self, value: Option<T>) -> T;

    /// Deliver a one-way message to `target`'s message handler.
    fn remote_call(&self, target: MachineId, message: PeerMessage);
}
