use ringkv_lib::{finger_start, is_strictly_between, Identifier, M};
use serde::Serialize;

use crate::node::NodeInfo;

#[derive(Debug, Clone, Serialize)]
pub struct Finger {
    pub start: Identifier,
    pub node: NodeInfo,
}

/// Routing table of `M` entries; entry `i` holds the first node at or after
/// `owner + 2^i`. Entry 0 mirrors the successor.
#[derive(Debug, Clone)]
pub struct FingerTable {
    owner: NodeInfo,
    entries: Vec<Finger>,
}

impl FingerTable {
    /// Every entry starts out pointing at the owner (a singleton ring).
    pub fn new(owner: &NodeInfo) -> Self {
        let entries = (0..M)
            .map(|i| Finger {
                start: finger_start(owner.id, i),
                node: owner.clone(),
            })
            .collect();
        Self {
            owner: owner.clone(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Finger> {
        self.entries.get(i)
    }

    pub fn start(&self, i: usize) -> Option<Identifier> {
        self.entries.get(i).map(|finger| finger.start)
    }

    /// Replaces the node of entry `i`. Out of range indices are ignored.
    pub fn set(&mut self, i: usize, node: NodeInfo) {
        if let Some(finger) = self.entries.get_mut(i) {
            finger.node = node;
        }
    }

    pub fn entries(&self) -> &[Finger] {
        &self.entries
    }

    // Finds the entry that most immediately precedes `target`, scanning from
    // the farthest finger down. Falls back to the owner when none qualifies.
    pub fn closest_preceding(&self, target: Identifier) -> NodeInfo {
        self.entries
            .iter()
            .rev()
            .map(|finger| &finger.node)
            .find(|node| is_strictly_between(node.id, self.owner.id, target))
            .unwrap_or(&self.owner)
            .clone()
    }
}
