//! The CRUSH tree: parent/child topology of failure-domain buckets.
//!
//! Nodes are stored in an index arena with parent and child links held as
//! indices, so the tree carries back-references without ownership cycles.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::Osd;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("{0:?} is not a CRUSH bucket known to this cluster")]
    UnknownBucket(String),
    #[error("node {name} has no ancestor of type {node_type:?}")]
    NoAncestorOfType { name: String, node_type: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrushNodeDump {
    pub id: i32,
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub reweight: f64,
    #[serde(default)]
    pub children: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct CrushNode {
    pub id: i32,
    pub name: String,
    pub node_type: String,
    pub device_class: String,
    pub reweight: f64,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl CrushNode {
    pub fn is_osd(&self) -> bool {
        self.node_type == "osd"
    }
}

#[derive(Debug, Default)]
pub struct CrushTree {
    nodes: Vec<CrushNode>,
    by_id: HashMap<i32, usize>,
    by_name: HashMap<String, usize>,
}

impl CrushTree {
    pub fn from_nodes(dump: Vec<CrushNodeDump>) -> Self {
        let mut tree = CrushTree {
            nodes: Vec::with_capacity(dump.len()),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        };

        for n in &dump {
            let idx = tree.nodes.len();
            tree.nodes.push(CrushNode {
                id: n.id,
                name: n.name.clone(),
                node_type: n.node_type.clone(),
                device_class: n.device_class.clone(),
                reweight: n.reweight,
                parent: None,
                children: Vec::new(),
            });
            tree.by_id.insert(n.id, idx);
            tree.by_name.insert(n.name.clone(), idx);
        }

        for n in &dump {
            let parent_idx = tree.by_id[&n.id];
            for child_id in &n.children {
                if let Some(&child_idx) = tree.by_id.get(child_id) {
                    tree.nodes[child_idx].parent = Some(parent_idx);
                    tree.nodes[parent_idx].children.push(child_idx);
                }
            }
        }

        tree
    }

    pub fn node_by_id(&self, id: i32) -> Option<&CrushNode> {
        self.by_id.get(&id).map(|&idx| &self.nodes[idx])
    }

    pub fn node_by_name(&self, name: &str) -> Option<&CrushNode> {
        self.by_name.get(name).map(|&idx| &self.nodes[idx])
    }

    pub fn parent(&self, node: &CrushNode) -> Option<&CrushNode> {
        node.parent.map(|idx| &self.nodes[idx])
    }

    /// The id of the node's direct parent bucket, if any.
    pub fn parent_id(&self, node: &CrushNode) -> Option<i32> {
        self.parent(node).map(|p| p.id)
    }

    /// The closest strict ancestor whose type equals `node_type`.
    pub fn nearest_ancestor_of_type(
        &self,
        node: &CrushNode,
        node_type: &str,
    ) -> Option<&CrushNode> {
        let mut current = self.parent(node);
        while let Some(n) = current {
            if n.node_type == node_type {
                return Some(n);
            }
            current = self.parent(n);
        }
        None
    }

    /// Like [`nearest_ancestor_of_type`], but an absent ancestor is an error.
    ///
    /// [`nearest_ancestor_of_type`]: CrushTree::nearest_ancestor_of_type
    pub fn require_ancestor_of_type(
        &self,
        node: &CrushNode,
        node_type: &str,
    ) -> Result<&CrushNode, TopologyError> {
        self.nearest_ancestor_of_type(node, node_type)
            .ok_or_else(|| TopologyError::NoAncestorOfType {
                name: node.name.clone(),
                node_type: node_type.to_string(),
            })
    }

    /// All descendant OSDs of the named bucket with `reweight > 0`, filtered
    /// by device class when one is given. Nested buckets expand transitively.
    pub fn osds_under(
        &self,
        bucket: &str,
        device_class: Option<&str>,
    ) -> Result<Vec<Osd>, TopologyError> {
        let &idx = self
            .by_name
            .get(bucket)
            .ok_or_else(|| TopologyError::UnknownBucket(bucket.to_string()))?;

        let mut osds = Vec::new();
        let mut stack = vec![idx];
        while let Some(idx) = stack.pop() {
            for &child_idx in &self.nodes[idx].children {
                let child = &self.nodes[child_idx];
                if !child.is_osd() {
                    stack.push(child_idx);
                    continue;
                }
                if child.reweight == 0.0 {
                    // 'out' OSD.
                    continue;
                }
                if let Some(class) = device_class {
                    if child.device_class != class {
                        continue;
                    }
                }
                osds.push(child.id);
            }
        }
        Ok(osds)
    }
}
