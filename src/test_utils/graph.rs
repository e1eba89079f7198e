/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A small in-memory [`GraphShard`] for exercising aggregations: local
//! vertices (owned or ghost) with attached in-edge lists.

use crate::comm::MachineId;
use crate::graph::GraphShard;

/// A vertex handle of the toy graph.
#[derive(Clone, Debug)]
pub struct TestVertex {
    /// The vertex's global id.
    pub id: usize,
    /// The vertex's data value.
    pub value: f64,
}

/// A directed edge handle of the toy graph.
#[derive(Clone, Debug)]
pub struct TestEdge {
    /// Global id of the source vertex.
    pub source: usize,
    /// Global id of the target vertex.
    pub target: usize,
    /// The edge's data value.
    pub weight: f64,
}

struct VertexRecord {
    id: usize,
    owner: MachineId,
    value: f64,
}

/// One machine's shard of a toy partitioned graph.
///
/// Ghost replicas are added like owned vertices, with a different owner;
/// edges are attached to the shard that canonically stores their target.
#[derive(Default)]
pub struct TestGraph {
    vertices: Vec<VertexRecord>,
    in_edges: Vec<Vec<TestEdge>>,
}

impl TestGraph {
    /// Create an empty shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a local vertex and return its local index.
    pub fn add_vertex(&mut self, id: usize, owner: MachineId, value: f64) -> usize {
        self.vertices.push(VertexRecord { id, owner, value });
        self.in_edges.push(Vec::new());
        self.vertices.len() - 1
    }

    /// Attach an in-edge from the vertex with global id `source` to the
    /// local vertex at `target_index`.
    pub fn add_in_edge(&mut self, target_index: usize, source: usize, weight: f64) {
        let target = self.vertices[target_index].id;
        self.in_edges[target_index].push(TestEdge {
            source,
            target,
            weight,
        });
    }
}

impl GraphShard for TestGraph {
    type Vertex = TestVertex;
    type Edge = TestEdge;

    fn num_local_vertices(&self) -> usize {
        self.vertices.len()
    }

    fn local_vertex(&self, index: usize) -> TestVertex {
        let record = &self.vertices[index];
        TestVertex {
            id: record.id,
            value: record.value,
        }
    }

    fn owner(&self, index: usize) -> MachineId {
        self.vertices[index].owner
    }

    fn in_edges(&self, index: usize) -> Box<dyn Iterator<Item = TestEdge> + '_> {
        Box::new(self.in_edges[index].iter().cloned())
    }
}
