/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The distributed aggregator: named map-reduce-finalize pipelines over a
//! partitioned graph, run on demand or on a periodic schedule.
//!
//! The host engine passes through registration calls, then drives the
//! aggregator during its run:
//!
//! - `aggregate_all_periodic()` once at startup to prime finalizers,
//! - `start(ncpus)` to arm the schedule (and, when `ncpus > 0`, the
//!   asynchronous per-key state),
//! - either `tick_sync()` in lockstep from one thread per machine, or
//!   `tick_async()`/`tick_async_compute()` from its worker pool (never
//!   both within one run),
//! - `stop()` at termination.
//!
//! Every aggregation is two-phase: a thread-parallel fold over the locally
//! owned shard, then gather-to-coordinator, combine, and broadcast, so the
//! user finalizer observes the identical combined sum on every machine.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::TryLockError;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::accum::ErasedReduction;
use crate::accum::ReduceValue;
use crate::accum::Reduction;
use crate::clock::Clock;
use crate::clock::ClockKind;
use crate::comm::COORDINATOR;
use crate::comm::Cluster;
use crate::comm::PeerMessage;
use crate::data::Snapshot;
use crate::graph::GraphShard;
use crate::schedule::Schedule;

/// Per-key state for asynchronous aggregation: the coordinator-side root
/// sum, one clone per worker thread, and the two countdowns that drive
/// the fold/finalize handshakes.
struct AsyncKeyState<C, V, E> {
    root: Box<dyn ErasedReduction<C, V, E>>,
    per_thread: Vec<Box<dyn ErasedReduction<C, V, E>>>,
    local_remaining: AtomicI64,
    /// Authoritative only on the coordinator; reused for both the
    /// peer-fold and the finalize-acknowledgement phases.
    peers_remaining: AtomicI64,
}

/// The distributed aggregator over one machine's shard of the graph.
///
/// Each machine in the engine run constructs its own aggregator and is
/// expected to register the same keys with compatible signatures; the
/// collective operations (`aggregate_now`, `aggregate_periodic`,
/// `aggregate_all_periodic`, `start`, `tick_sync`) must be entered by all
/// machines with identical arguments, in the same order.
pub struct Aggregator<C, G: GraphShard, N> {
    context: Arc<C>,
    graph: Arc<G>,
    comm: Arc<N>,
    clock: ClockKind,
    reductions: DashMap<String, Arc<dyn ErasedReduction<C, G::Vertex, G::Edge>>>,
    periods: Mutex<BTreeMap<String, Duration>>,
    schedule: Mutex<Schedule>,
    async_state: DashMap<String, AsyncKeyState<C, G::Vertex, G::Edge>>,
    start_time: Mutex<Duration>,
    ncpus: AtomicUsize,
}

impl<C, G, N> Aggregator<C, G, N>
where
    C: Send + Sync + 'static,
    G: GraphShard,
    N: Cluster,
{
    /// Create an aggregator over one machine's shard. `context` is the
    /// opaque engine handle threaded through map and finalize callbacks.
    pub fn new(context: Arc<C>, graph: Arc<G>, comm: Arc<N>) -> Self {
        Self::with_clock(context, graph, comm, ClockKind::default())
    }

    /// Create an aggregator with an explicit time source.
    pub fn with_clock(context: Arc<C>, graph: Arc<G>, comm: Arc<N>, clock: ClockKind) -> Self {
        Self {
            context,
            graph,
            comm,
            clock,
            reductions: DashMap::new(),
            periods: Mutex::new(BTreeMap::new()),
            schedule: Mutex::new(Schedule::new()),
            async_state: DashMap::new(),
            start_time: Mutex::new(Duration::ZERO),
            ncpus: AtomicUsize::new(0),
        }
    }

    /// Register a vertex reduction under `key`. The map function runs over
    /// every vertex of the graph (each vertex exactly once cluster-wide),
    /// its results are summed, and the finalizer is invoked with the
    /// combined sum on every machine.
    ///
    /// Returns false, changing nothing, if the key is empty or already
    /// registered.
    pub fn add_vertex_reduction<T: ReduceValue>(
        &self,
        key: &str,
        map: impl Fn(&C, &G::Vertex) -> T + Send + Sync + 'static,
        finalize: impl Fn(&C, &T) + Send + Sync + 'static,
    ) -> bool {
        if key.is_empty() {
            return false;
        }
        match self.reductions.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Reduction::<T, C, G::Vertex, G::Edge>::vertex(
                    map, finalize,
                )));
                true
            }
        }
    }

    /// Register an edge reduction under `key`. The map function runs over
    /// every edge of the graph (each edge exactly once cluster-wide);
    /// otherwise as [`Self::add_vertex_reduction`].
    pub fn add_edge_reduction<T: ReduceValue>(
        &self,
        key: &str,
        map: impl Fn(&C, &G::Edge) -> T + Send + Sync + 'static,
        finalize: impl Fn(&C, &T) + Send + Sync + 'static,
    ) -> bool {
        if key.is_empty() {
            return false;
        }
        match self.reductions.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Reduction::<T, C, G::Vertex, G::Edge>::edge(
                    map, finalize,
                )));
                true
            }
        }
    }

    /// Request that `key` be aggregated every `seconds` seconds while the
    /// engine runs. Zero means every tick. Collective: all machines must
    /// call with identical arguments.
    ///
    /// Returns false if the period is negative or not finite, or if the
    /// key is not registered.
    pub fn aggregate_periodic(&self, key: &str, seconds: f64) -> bool {
        self.comm.barrier();
        if !seconds.is_finite() || seconds < 0.0 {
            return false;
        }
        if !self.reductions.contains_key(key) {
            return false;
        }
        self.periods
            .lock()
            .unwrap()
            .insert(key.to_string(), Duration::from_secs_f64(seconds));
        true
    }

    /// The keys currently registered with a period.
    pub fn list_periodic_keys(&self) -> BTreeSet<String> {
        self.periods.lock().unwrap().keys().cloned().collect()
    }

    /// Perform an immediate aggregation of `key`. Collective: all machines
    /// must call simultaneously, and every machine's finalizer observes
    /// the same combined sum.
    ///
    /// An unregistered key is a fatal error.
    pub fn aggregate_now(&self, key: &str) -> bool {
        let reduction = match self.reductions.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => panic!("no aggregator registered under key {key}"),
        };
        reduction.clear();
        self.local_fold(reduction.as_ref());
        self.combine_and_finalize(reduction.as_ref());
        true
    }

    /// Aggregate every key registered with a period, in key order. Used by
    /// the engine at startup to prime finalizers. Collective.
    pub fn aggregate_all_periodic(&self) {
        let keys: Vec<String> = self.periods.lock().unwrap().keys().cloned().collect();
        for key in keys {
            self.aggregate_now(&key);
        }
    }

    /// Arm the schedule. Must be called on engine start, on all machines
    /// simultaneously. `ncpus` is the number of engine worker threads and
    /// is only meaningful for the asynchronous drivers; when it is
    /// positive, the per-key asynchronous state is materialized.
    pub fn start(&self, ncpus: usize) {
        self.comm.barrier();
        let periods = self.periods.lock().unwrap().clone();
        {
            let mut schedule = self.schedule.lock().unwrap();
            schedule.clear();
            for (key, period) in &periods {
                schedule.push(key.clone(), *period);
            }
        }
        *self.start_time.lock().unwrap() = self.clock.now();
        self.ncpus.store(ncpus, Ordering::SeqCst);
        self.async_state.clear();
        if ncpus > 0 {
            for key in periods.keys() {
                let reduction = match self.reductions.get(key) {
                    Some(entry) => Arc::clone(entry.value()),
                    None => panic!("periodic key {key} missing from the registry"),
                };
                self.async_state.insert(
                    key.clone(),
                    AsyncKeyState {
                        root: reduction.clone_empty(),
                        per_thread: (0..ncpus).map(|_| reduction.clone_empty()).collect(),
                        local_remaining: AtomicI64::new(ncpus as i64),
                        peers_remaining: AtomicI64::new(self.comm.num_machines() as i64),
                    },
                );
            }
        }
    }

    /// Reset the aggregator at engine stop: clears the schedule, every
    /// registered sum, and the asynchronous state. The caller guarantees
    /// that no tick is in flight.
    pub fn stop(&self) {
        self.schedule.lock().unwrap().clear();
        for entry in self.reductions.iter() {
            entry.value().clear();
        }
        self.async_state.clear();
    }

    /// Advance the schedule in lockstep. To be called simultaneously by
    /// exactly one thread on each machine, at a cadence chosen by the
    /// engine; each due key is aggregated at most once per tick.
    pub fn tick_sync(&self) {
        let is_coordinator = self.comm.machine() == COORDINATOR;
        // "Now" is frozen for the tick, and the coordinator's reading is
        // canonical on every machine.
        let local_now = self.elapsed();
        let now: Duration = self.comm.broadcast(is_coordinator.then_some(local_now));
        loop {
            let due = {
                let schedule = self.schedule.lock().unwrap();
                match schedule.peek() {
                    Some((fire_at, key)) if fire_at < now => Some(key.to_string()),
                    _ => None,
                }
            };
            let Some(key) = due else { break };
            tracing::debug!(key = %key, "synchronous aggregation due");
            self.aggregate_now(&key);
            self.schedule.lock().unwrap().pop();
            let period = self.period_of(&key);
            let local_next = self.elapsed() + period;
            let next: Duration = self.comm.broadcast(is_coordinator.then_some(local_next));
            self.schedule.lock().unwrap().push(key, next);
        }
    }

    /// Poll the schedule for a due key, without blocking. Returns a key to
    /// exactly one caller per machine; once a key is returned, every one
    /// of the `ncpus` worker threads must eventually call
    /// [`Self::tick_async_compute`] with it exactly once.
    ///
    /// Under lock contention this returns `None` even if a key is due;
    /// ticks are frequent and the key fires on a later tick.
    pub fn tick_async(&self) -> Option<String> {
        let mut schedule = match self.schedule.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(err)) => panic!("schedule lock poisoned: {err}"),
        };
        let now = self.elapsed();
        match schedule.peek() {
            Some((fire_at, _)) if fire_at < now => schedule.pop().map(|(_, key)| key),
            _ => None,
        }
    }

    /// Perform worker thread `cpuid`'s share of the asynchronous
    /// aggregation of `key`: fold this thread's slice of the local
    /// partition, combine into the machine's root sum, and, on the last
    /// worker, hand the machine's sum to the coordinator.
    pub fn tick_async_compute(&self, cpuid: usize, key: &str) {
        let state = self
            .async_state
            .get(key)
            .unwrap_or_else(|| panic!("no asynchronous state for key {key}"));
        let ncpus = self.ncpus.load(Ordering::SeqCst);
        assert!(
            cpuid < state.per_thread.len(),
            "cpu id {cpuid} out of range for key {key}"
        );

        let shard = state.per_thread[cpuid].as_ref();
        self.fold_stride(shard, cpuid, ncpus);
        state.root.merge_from(shard);

        let remaining = state.local_remaining.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(
            remaining >= 0 && remaining < ncpus as i64,
            "local countdown for key {key} out of bounds: {remaining}"
        );
        if remaining == 0 {
            // Last worker on this machine: restore the per-thread clones
            // and the countdown for the next round.
            for shard in &state.per_thread {
                shard.clear();
            }
            state.local_remaining.store(ncpus as i64, Ordering::SeqCst);
            if self.comm.machine() != COORDINATOR {
                let snapshot = state.root.export_value().expect("encode local sum");
                state.root.clear();
                drop(state);
                self.comm.remote_call(
                    COORDINATOR,
                    PeerMessage::MergeSum {
                        key: key.to_string(),
                        snapshot,
                    },
                );
            } else {
                drop(state);
                self.decrement_distributed(key);
            }
        }
    }

    /// RPC entry point: merge a peer machine's local sum for `key` into
    /// the coordinator's root sum.
    pub fn merge_from_peer(&self, key: &str, snapshot: Snapshot) {
        let state = self
            .async_state
            .get(key)
            .unwrap_or_else(|| panic!("no asynchronous state for key {key}"));
        state.root.merge_serialized(&snapshot).expect("merge peer sum");
        drop(state);
        self.decrement_distributed(key);
    }

    /// RPC entry point: finalize `key` against the coordinator's combined
    /// sum, then acknowledge.
    pub fn perform_finalize(&self, key: &str, snapshot: Snapshot) {
        assert_ne!(
            self.comm.machine(),
            COORDINATOR,
            "the coordinator finalizes directly"
        );
        let state = self
            .async_state
            .get(key)
            .unwrap_or_else(|| panic!("no asynchronous state for key {key}"));
        state
            .root
            .overwrite_serialized(&snapshot)
            .expect("overwrite with combined sum");
        state.root.finalize(&self.context);
        state.root.clear();
        drop(state);
        self.comm.remote_call(
            COORDINATOR,
            PeerMessage::FinalizeDone {
                key: key.to_string(),
            },
        );
    }

    /// RPC entry point: record one machine's completed finalize for `key`;
    /// the last acknowledgement re-arms the schedule everywhere.
    pub fn ack_finalize(&self, key: &str) {
        let state = self
            .async_state
            .get(key)
            .unwrap_or_else(|| panic!("no asynchronous state for key {key}"));
        let remaining = state.peers_remaining.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            state
                .peers_remaining
                .store(self.comm.num_machines() as i64, Ordering::SeqCst);
            drop(state);
            let next = self.elapsed() + self.period_of(key);
            tracing::info!(key = %key, at_secs = next.as_secs_f64(), "rescheduling");
            self.schedule_key(key.to_string(), next);
            for machine in 1..self.comm.num_machines() {
                self.comm.remote_call(
                    machine,
                    PeerMessage::ScheduleKey {
                        key: key.to_string(),
                        fire_at: next,
                    },
                );
            }
        }
    }

    /// RPC entry point: re-insert `key` into the local schedule.
    pub fn schedule_key(&self, key: String, fire_at: Duration) {
        self.schedule.lock().unwrap().push(key, fire_at);
    }

    /// Hand an incoming peer message to the matching entry point.
    pub fn dispatch(&self, message: PeerMessage) {
        match message {
            PeerMessage::MergeSum { key, snapshot } => self.merge_from_peer(&key, snapshot),
            PeerMessage::PerformFinalize { key, snapshot } => self.perform_finalize(&key, snapshot),
            PeerMessage::FinalizeDone { key } => self.ack_finalize(&key),
            PeerMessage::ScheduleKey { key, fire_at } => self.schedule_key(key, fire_at),
        }
    }

    /// Count down the machines still folding `key`; on the last one,
    /// dispatch the finalize phase. Coordinator only.
    fn decrement_distributed(&self, key: &str) {
        assert_eq!(
            self.comm.machine(),
            COORDINATOR,
            "the distributed countdown lives on the coordinator"
        );
        let state = self
            .async_state
            .get(key)
            .unwrap_or_else(|| panic!("no asynchronous state for key {key}"));
        let numprocs = self.comm.num_machines() as i64;
        let remaining = state.peers_remaining.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(key = %key, remaining, "distributed aggregation progress");
        assert!(
            remaining >= 0 && remaining < numprocs,
            "distributed countdown for key {key} out of bounds: {remaining}"
        );
        if remaining == 0 {
            tracing::info!(key = %key, "aggregate completion");
            let snapshot = state.root.export_value().expect("encode combined sum");
            // The countdown is reused for the finalize-acknowledgement
            // phase.
            state.peers_remaining.store(numprocs, Ordering::SeqCst);
            for machine in 1..self.comm.num_machines() {
                self.comm.remote_call(
                    machine,
                    PeerMessage::PerformFinalize {
                        key: key.to_string(),
                        snapshot: snapshot.clone(),
                    },
                );
            }
            state.root.finalize(&self.context);
            state.root.clear();
            drop(state);
            self.ack_finalize(key);
        }
    }

    /// Thread-parallel fold of the local partition into `reduction`.
    fn local_fold(&self, reduction: &dyn ErasedReduction<C, G::Vertex, G::Edge>) {
        let nthreads = match self.ncpus.load(Ordering::SeqCst) {
            0 => std::thread::available_parallelism()
                .map(|parallelism| parallelism.get())
                .unwrap_or(1),
            ncpus => ncpus,
        };
        std::thread::scope(|scope| {
            for tid in 0..nthreads {
                let shard = reduction.clone_empty();
                scope.spawn(move || {
                    self.fold_stride(shard.as_ref(), tid, nthreads);
                    reduction.merge_from(shard.as_ref());
                });
            }
        });
    }

    /// Fold local vertex indices `offset, offset+stride, …` into `shard`.
    /// Vertex reductions map only vertices owned by this machine, so ghost
    /// replicas contribute nowhere; edge reductions map the in-edges of
    /// every visited vertex, which visits each edge exactly once
    /// cluster-wide.
    fn fold_stride(
        &self,
        shard: &dyn ErasedReduction<C, G::Vertex, G::Edge>,
        offset: usize,
        stride: usize,
    ) {
        let num_local = self.graph.num_local_vertices();
        if shard.is_vertex_kind() {
            let me = self.comm.machine();
            for index in (offset..num_local).step_by(stride) {
                if self.graph.owner(index) == me {
                    let vertex = self.graph.local_vertex(index);
                    shard.map_vertex(&self.context, &vertex);
                }
            }
        } else {
            for index in (offset..num_local).step_by(stride) {
                for edge in self.graph.in_edges(index) {
                    shard.map_edge(&self.context, &edge);
                }
            }
        }
    }

    /// Gather-to-coordinator, combine, broadcast, then finalize and clear
    /// on every machine.
    fn combine_and_finalize(&self, reduction: &dyn ErasedReduction<C, G::Vertex, G::Edge>) {
        let local = reduction.export_value().expect("encode local sum");
        match self.comm.gather(local) {
            Some(snapshots) => {
                for snapshot in snapshots.iter().skip(1) {
                    reduction
                        .merge_serialized(snapshot)
                        .expect("merge gathered sum");
                }
                let combined = reduction.export_value().expect("encode combined sum");
                self.comm.broadcast(Some(combined));
            }
            None => {
                let combined: Snapshot = self.comm.broadcast(None);
                reduction
                    .overwrite_serialized(&combined)
                    .expect("overwrite with combined sum");
            }
        }
        reduction.finalize(&self.context);
        reduction.clear();
    }

    fn period_of(&self, key: &str) -> Duration {
        match self.periods.lock().unwrap().get(key) {
            Some(period) => *period,
            None => panic!("scheduled key {key} missing from the period table"),
        }
    }

    fn elapsed(&self) -> Duration {
        self.clock
            .now()
            .saturating_sub(*self.start_time.lock().unwrap())
    }
}
