//! DAG diagnostics export
//!
//! Read-only dumps of the graph for observability: Graphviz DOT with node
//! color by state, and a structured JSON document that round-trips node
//! identities, state labels, and edges.

use serde::{Deserialize, Serialize};

use crate::dag::job::DagJobState;
use crate::dag::scheduler::DagScheduler;
use crate::error::{EngineError, EngineResult};

/// One node in a [`DagDump`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDumpNode {
    /// Node id
    pub id: u64,
    /// Node name
    pub name: String,
    /// State label at dump time
    pub state: DagJobState,
}

/// One edge in a [`DagDump`], pointing from dependency to dependent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDumpEdge {
    /// The node that must complete first
    pub from: u64,
    /// The node that waits on it
    pub to: u64,
}

/// Structured dump of the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDump {
    /// Nodes in insertion order
    pub nodes: Vec<DagDumpNode>,
    /// Dependency edges in execution direction
    pub edges: Vec<DagDumpEdge>,
}

fn state_color(state: DagJobState) -> &'static str {
    match state {
        DagJobState::Pending => "lightgray",
        DagJobState::Ready => "khaki",
        DagJobState::Running => "lightblue",
        DagJobState::Completed => "palegreen",
        DagJobState::Failed => "lightcoral",
        DagJobState::Cancelled => "orange",
        DagJobState::Skipped => "gray",
    }
}

impl DagScheduler {
    /// Build the structured dump
    pub fn dump(&self) -> DagDump {
        let graph = self.graph().read();
        let nodes = graph
            .order
            .iter()
            .filter_map(|id| graph.jobs.get(id))
            .map(|node| DagDumpNode {
                id: node.dag_id(),
                name: node.name().to_string(),
                state: node.state(),
            })
            .collect();

        let mut edges = Vec::new();
        for &dependent in &graph.order {
            if let Some(deps) = graph.dependencies.get(&dependent) {
                for &dependency in deps {
                    edges.push(DagDumpEdge {
                        from: dependency,
                        to: dependent,
                    });
                }
            }
        }
        DagDump { nodes, edges }
    }

    /// Graphviz DOT rendering with node color by state
    pub fn to_dot(&self) -> String {
        let dump = self.dump();
        let mut out = String::from("digraph dag {\n  rankdir=LR;\n  node [style=filled];\n");
        for node in &dump.nodes {
            out.push_str(&format!(
                "  n{} [label=\"{}\\n{}\" fillcolor={}];\n",
                node.id,
                node.name.replace('"', "\\\""),
                node.state.as_str(),
                state_color(node.state)
            ));
        }
        for edge in &dump.edges {
            out.push_str(&format!("  n{} -> n{};\n", edge.from, edge.to));
        }
        out.push_str("}\n");
        out
    }

    /// JSON rendering of the structured dump
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(&self.dump())
            .map_err(|err| EngineError::Unknown(format!("dag json export failed: {err}")))
    }
}
