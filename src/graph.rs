//! The dependency graph underlying a stack.
//!
//! Nodes are [`ResourceNode`]s; an edge `A -> B` means B consumes one of A's
//! output attributes. Edges are derived from input references at insertion
//! time, so the caller never declares them explicitly.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::resource::ResourceNode;

pub(crate) struct DependencyGraph {
    pub(crate) graph: DiGraph<ResourceNode, ()>,
    pub(crate) names: HashMap<ArcStr, NodeIndex>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            names: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.names.get(name).map(|index| &self.graph[*index])
    }

    /// Inserts a node, validating its references against the nodes already
    /// present. A reference to a name not yet inserted is a configuration
    /// error, which is what makes forward references (and therefore cycles)
    /// unconstructible through the builder.
    pub(crate) fn add(&mut self, node: ResourceNode) -> Result<NodeIndex, ConfigError> {
        if self.names.contains_key(&node.name) {
            return Err(ConfigError::DuplicateName(node.name.to_string()));
        }

        for input in node.inputs.values() {
            let Some(reference) = input.reference() else {
                continue;
            };

            let Some(producer) = self.get(&reference.node) else {
                return Err(ConfigError::UnknownResource(
                    node.name.to_string(),
                    reference.node.to_string(),
                ));
            };

            if !producer.kind.outputs().contains(&&*reference.output) {
                return Err(ConfigError::UnknownOutput(
                    node.name.to_string(),
                    reference.node.to_string(),
                    reference.output.to_string(),
                ));
            }
        }

        let dependencies: Vec<NodeIndex> = node
            .depends_on()
            .iter()
            .map(|producer| self.names[producer])
            .collect();

        let name = node.name.clone();
        let index = self.graph.add_node(node);
        self.names.insert(name, index);

        for dependency in dependencies {
            self.graph.add_edge(dependency, index, ());
        }

        Ok(index)
    }

    /// Produces an order in which every node appears after all of its
    /// producers. Ties break by declaration order, so independent nodes
    /// apply in the order a reader of the declaration would expect.
    ///
    /// The builder cannot construct a cycle, but the engine still refuses to
    /// traverse one in case the graph was assembled by other means.
    pub(crate) fn topo_order(&self) -> Result<Vec<NodeIndex>, ConfigError> {
        let count = self.graph.node_count();

        let mut indegree = vec![0usize; count];
        for edge in self.graph.raw_edges() {
            indegree[edge.target().index()] += 1;
        }

        // Min-heap on the node index, which is the declaration order.
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(count);

        while let Some(Reverse(i)) = ready.pop() {
            let index = NodeIndex::new(i);
            order.push(index);

            for consumer in self.graph.neighbors_directed(index, Direction::Outgoing) {
                indegree[consumer.index()] -= 1;
                if indegree[consumer.index()] == 0 {
                    ready.push(Reverse(consumer.index()));
                }
            }
        }

        if order.len() != count {
            let stuck: Vec<&str> = self
                .graph
                .node_indices()
                .filter(|index| !order.contains(index))
                .map(|index| self.graph[index].name())
                .collect();

            return Err(ConfigError::Cycle(stuck.join(", ")));
        }

        Ok(order)
    }
}
