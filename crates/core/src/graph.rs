use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, Result};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node of a backend execution graph in API format: a node class plus its
/// input fields. An input is either a literal value or a link
/// `[source_node_id, output_index]` to another node's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A node-id keyed graph document, serialized exactly as the backend's
/// job-intake interface expects it. Ordered by id so two equal documents
/// always serialize byte-identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphDocument {
    nodes: BTreeMap<String, GraphNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub from_node: String,
    pub output_index: u64,
    pub to_node: String,
    pub to_field: String,
}

impl GraphDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, id: impl Into<String>, node: GraphNode) -> Result<()> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            bail!("duplicate node id: {id}");
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn input(&self, node_id: &str, field: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.inputs.get(field)
    }

    /// Overwrites one literal input field. Refuses to replace a link, since
    /// that would silently rewire the graph.
    pub fn set_input(&mut self, node_id: &str, field: &str, value: Value) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| anyhow!("graph has no node '{node_id}'"))?;

        if node.inputs.get(field).is_some_and(is_link) {
            bail!("node '{node_id}' input '{field}' is a link and cannot be overwritten");
        }

        node.inputs.insert(field.to_string(), value);
        Ok(())
    }

    pub fn links(&self) -> Vec<NodeLink> {
        let mut links = Vec::new();
        for (to_node, node) in &self.nodes {
            for (field, value) in &node.inputs {
                if let Some((from_node, output_index)) = link_parts(value) {
                    links.push(NodeLink {
                        from_node: from_node.to_string(),
                        output_index,
                        to_node: to_node.clone(),
                        to_field: field.clone(),
                    });
                }
            }
        }
        links
    }

    /// Checks that every link points at an existing node and that the link
    /// structure is acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("graph has no nodes");
        }
        self.execution_order().map(|_| ())
    }

    /// Node ids in an order where every node comes after the nodes it reads from.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut graph: StableDiGraph<&str, String> = StableDiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

        for id in self.nodes.keys() {
            indices.insert(id.as_str(), graph.add_node(id.as_str()));
        }

        for link in self.links() {
            let from_idx = indices.get(link.from_node.as_str()).copied().ok_or_else(|| {
                anyhow!(
                    "node '{}' input '{}' links to unknown node '{}'",
                    link.to_node,
                    link.to_field,
                    link.from_node
                )
            })?;
            let to_idx = indices[link.to_node.as_str()];
            graph.add_edge(from_idx, to_idx, link.to_field);
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            anyhow!(
                "cycle detected in graph at node '{}'",
                graph[cycle.node_id()]
            )
        })?;

        Ok(order.into_iter().map(|idx| graph[idx].to_string()).collect())
    }
}

pub fn is_link(value: &Value) -> bool {
    link_parts(value).is_some()
}

fn link_parts(value: &Value) -> Option<(&str, u64)> {
    match value.as_array()?.as_slice() {
        [Value::String(node), Value::Number(index)] => Some((node.as_str(), index.as_u64()?)),
        _ => None,
    }
}
