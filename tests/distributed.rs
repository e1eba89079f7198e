/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end aggregation scenarios over in-process multi-machine meshes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use mapfold::Aggregator;
use mapfold::Cluster;
use mapfold::ClockKind;
use mapfold::SimClock;
use mapfold::comm::local;
use mapfold::comm::local::LocalMachine;
use mapfold::test_utils::graph::TestEdge;
use mapfold::test_utils::graph::TestGraph;
use mapfold::test_utils::graph::TestVertex;
use mapfold::test_utils::sink::Capture;

type SumAggregator = Aggregator<Capture<f64>, TestGraph, LocalMachine>;

fn sum_aggregator(
    machine: LocalMachine,
    graph: TestGraph,
    clock: &SimClock,
) -> (Arc<SumAggregator>, Arc<Capture<f64>>, Arc<LocalMachine>) {
    let comm = Arc::new(machine);
    let capture = Arc::new(Capture::new());
    let aggregator = Arc::new(Aggregator::with_clock(
        Arc::clone(&capture),
        Arc::new(graph),
        Arc::clone(&comm),
        ClockKind::Sim(clock.clone()),
    ));
    comm.serve({
        let aggregator = Arc::clone(&aggregator);
        move |message| aggregator.dispatch(message)
    });
    assert!(aggregator.add_vertex_reduction(
        "sum",
        |_, vertex: &TestVertex| vertex.value,
        |capture: &Capture<f64>, total: &f64| capture.push(*total),
    ));
    (aggregator, capture, comm)
}

/// Vertices 0..=4 (values 1..=5) spread over three machines, plus vertex
/// 9 (value 7, owned by machine 1) ghosted on every machine. The ghost
/// must contribute exactly once, so the cluster-wide sum is 22.
fn ghosted_shard(machine: usize) -> TestGraph {
    let mut graph = TestGraph::new();
    match machine {
        0 => {
            graph.add_vertex(0, 0, 1.0);
            graph.add_vertex(1, 0, 2.0);
        }
        1 => {
            graph.add_vertex(2, 1, 3.0);
            graph.add_vertex(3, 1, 4.0);
        }
        2 => {
            graph.add_vertex(4, 2, 5.0);
        }
        _ => unreachable!(),
    }
    graph.add_vertex(9, 1, 7.0);
    graph
}

#[test]
fn test_vertex_sum_with_ghosts_across_three_machines() {
    let clock = SimClock::new();
    let machines = local::mesh(3);
    let mut captures = Vec::new();
    thread::scope(|scope| {
        for (id, machine) in machines.into_iter().enumerate() {
            let clock = clock.clone();
            let (aggregator, capture, _comm) = sum_aggregator(machine, ghosted_shard(id), &clock);
            captures.push(capture);
            scope.spawn(move || {
                aggregator.start(2);
                assert!(aggregator.aggregate_now("sum"));
                aggregator.stop();
            });
        }
    });
    // Every machine's finalizer observed the same combined sum, with the
    // ghost counted once.
    for capture in &captures {
        assert_eq!(capture.values(), vec![22.0]);
    }
}

#[test]
fn test_edge_count_across_three_machines() {
    // 100 edges split 40/35/25; each shard stores its edges on the
    // in-edge list of a locally stored vertex.
    let edges_per_machine = [40usize, 35, 25];
    let clock = SimClock::new();
    let machines = local::mesh(3);
    let mut captures = Vec::new();
    thread::scope(|scope| {
        for (id, machine) in machines.into_iter().enumerate() {
            let mut graph = TestGraph::new();
            let target = graph.add_vertex(id, id, 0.0);
            for source in 0..edges_per_machine[id] {
                graph.add_in_edge(target, 100 + source, 1.0);
            }
            let comm = Arc::new(machine);
            let capture: Arc<Capture<i64>> = Arc::new(Capture::new());
            let aggregator = Arc::new(Aggregator::with_clock(
                Arc::clone(&capture),
                Arc::new(graph),
                Arc::clone(&comm),
                ClockKind::Sim(clock.clone()),
            ));
            assert!(aggregator.add_edge_reduction(
                "edge_count",
                |_, _edge: &TestEdge| 1i64,
                |capture: &Capture<i64>, total: &i64| capture.push(*total),
            ));
            captures.push(capture);
            scope.spawn(move || {
                assert!(aggregator.aggregate_now("edge_count"));
            });
        }
    });
    for capture in &captures {
        assert_eq!(capture.values(), vec![100]);
    }
}

#[test]
fn test_sync_ticks_in_lockstep_across_machines() {
    const TICKS: usize = 5;
    let clock = SimClock::new();
    let machines = local::mesh(2);
    let mut captures = Vec::new();
    thread::scope(|scope| {
        for (id, machine) in machines.into_iter().enumerate() {
            let clock = clock.clone();
            let mut graph = TestGraph::new();
            // Machine 0 owns values 1..=3, machine 1 owns 4..=5.
            if id == 0 {
                for (vertex, value) in [(0usize, 1.0), (1, 2.0), (2, 3.0)] {
                    graph.add_vertex(vertex, 0, value);
                }
            } else {
                for (vertex, value) in [(3usize, 4.0), (4, 5.0)] {
                    graph.add_vertex(vertex, 1, value);
                }
            }
            let (aggregator, capture, comm) = sum_aggregator(machine, graph, &clock);
            captures.push(capture);
            scope.spawn(move || {
                assert!(aggregator.aggregate_periodic("sum", 0.0));
                aggregator.start(0);
                for _ in 0..TICKS {
                    comm.barrier();
                    if id == 0 {
                        clock.advance(Duration::from_secs(1));
                    }
                    comm.barrier();
                    aggregator.tick_sync();
                }
                aggregator.stop();
            });
        }
    });
    for capture in &captures {
        assert_eq!(capture.values(), vec![15.0; TICKS]);
    }
}

#[test]
fn test_async_aggregation_across_machines() {
    const ROUNDS: usize = 3;
    const NCPUS: usize = 2;
    let clock = SimClock::new();
    let machines = local::mesh(2);
    let mut captures = Vec::new();
    thread::scope(|scope| {
        for (id, machine) in machines.into_iter().enumerate() {
            let clock = clock.clone();
            let mut graph = TestGraph::new();
            if id == 0 {
                for (vertex, value) in [(0usize, 1.0), (1, 2.0), (2, 3.0)] {
                    graph.add_vertex(vertex, 0, value);
                }
            } else {
                for (vertex, value) in [(3usize, 4.0), (4, 5.0)] {
                    graph.add_vertex(vertex, 1, value);
                }
            }
            let (aggregator, capture, _comm) = sum_aggregator(machine, graph, &clock);
            captures.push(Arc::clone(&capture));
            scope.spawn(move || {
                assert!(aggregator.aggregate_periodic("sum", 0.0));
                aggregator.start(NCPUS);
                let deadline = Instant::now() + Duration::from_secs(30);
                while capture.count() < ROUNDS {
                    assert!(Instant::now() < deadline, "async rounds timed out");
                    if id == 0 {
                        clock.advance(Duration::from_millis(1));
                    }
                    if let Some(key) = aggregator.tick_async() {
                        for cpu in 0..NCPUS {
                            aggregator.tick_async_compute(cpu, &key);
                        }
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
    });
    for capture in &captures {
        assert!(capture.count() >= ROUNDS);
        for value in capture.values() {
            assert_eq!(value, 15.0);
        }
    }
}
