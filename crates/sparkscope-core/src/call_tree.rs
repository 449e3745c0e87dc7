//! Call-tree merging for sampled stacks.
//!
//! Each capture contributes one stack per matched thread. The stack is keyed
//! into a tree by [`ThreadGrouping`], then walked root-to-leaf: at every depth
//! the child whose [`NodeKey`] matches the frame is found or created and its
//! counters are bumped. The deepest frame also accrues self time.
//!
//! Nodes live in an arena (`Vec<CallTreeNode>`) and refer to their children by
//! [`NodeId`], so trees can be merged, cloned and serialized without any
//! ownership cycles. Children are kept in a `BTreeMap` keyed by identity,
//! which makes the merge (and the exported shape) a pure function of the
//! ordered input.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureSnapshot, StackFrame};
use crate::thread_policy::ThreadGrouping;

// =============================================================================
// Merge policy
// =============================================================================

/// How frames are matched to existing nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Same (type, method, overload) is the same node wherever it was called from.
    #[default]
    SameMethod,
    /// Additionally split by the caller's call-site line.
    SeparateParentCalls,
}

impl MergeMode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SameMethod => "same method",
            Self::SeparateParentCalls => "separate parent calls",
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Assigns a stable ordinal to each distinct signature of a (type, method)
/// pair, in first-seen order. Frames without a descriptor get ordinal 0.
#[derive(Debug, Clone, Default)]
pub struct MethodDisambiguator {
    seen: HashMap<(String, String), Vec<String>>,
}

impl MethodDisambiguator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disambiguate(&mut self, frame: &StackFrame) -> u32 {
        let Some(descriptor) = frame.descriptor.as_deref() else {
            return 0;
        };
        let variants = self
            .seen
            .entry((frame.declaring_type.clone(), frame.method.clone()))
            .or_default();
        let idx = variants
            .iter()
            .position(|d| d == descriptor)
            .unwrap_or_else(|| {
                variants.push(descriptor.to_string());
                variants.len() - 1
            });
        u32::try_from(idx).unwrap_or(u32::MAX)
    }

    /// Number of (type, method) pairs that have at least one descriptor.
    #[must_use]
    pub fn tracked_methods(&self) -> usize {
        self.seen.len()
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Method identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub declaring_type: String,
    pub method: String,
    pub disambiguator: u32,
}

/// Merge key of a child under its parent. `parent_line` is only populated
/// under [`MergeMode::SeparateParentCalls`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    pub identity: NodeIdentity,
    pub parent_line: Option<u32>,
}

/// Index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallTreeNode {
    pub key: NodeKey,
    pub children: BTreeMap<NodeKey, NodeId>,
    pub sample_count: u64,
    pub self_time: Duration,
    pub total_time: Duration,
}

impl CallTreeNode {
    fn new(key: NodeKey) -> Self {
        Self {
            key,
            children: BTreeMap::new(),
            sample_count: 0,
            self_time: Duration::ZERO,
            total_time: Duration::ZERO,
        }
    }

    fn record(&mut self, interval: Duration) {
        self.sample_count += 1;
        self.total_time += interval;
    }
}

// =============================================================================
// CallTree
// =============================================================================

/// One group's call tree. Node 0 is a synthetic root named after the group.
#[derive(Debug, Clone, PartialEq)]
pub struct CallTree {
    group: String,
    nodes: Vec<CallTreeNode>,
}

impl CallTree {
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        let group = group.into();
        let root = CallTreeNode::new(NodeKey {
            identity: NodeIdentity {
                declaring_type: group.clone(),
                method: String::new(),
                disambiguator: 0,
            },
            parent_line: None,
        });
        Self {
            group,
            nodes: vec![root],
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &CallTreeNode {
        &self.nodes[id.0]
    }

    #[must_use]
    pub fn root(&self) -> &CallTreeNode {
        &self.nodes[0]
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &CallTreeNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Find a direct child of `parent` by method name (first match in key order).
    #[must_use]
    pub fn child_by_method(&self, parent: NodeId, method: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .find(|(k, _)| k.identity.method == method)
            .map(|(_, id)| *id)
    }

    fn find_or_create(&mut self, parent: NodeId, key: NodeKey) -> NodeId {
        if let Some(&id) = self.nodes[parent.0].children.get(&key) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(CallTreeNode::new(key.clone()));
        self.nodes[parent.0].children.insert(key, id);
        id
    }

    fn merge_stack(
        &mut self,
        frames: &[StackFrame],
        mode: MergeMode,
        disambiguator: &mut MethodDisambiguator,
        interval: Duration,
    ) {
        self.nodes[0].record(interval);
        let mut current = NodeId::ROOT;
        let mut parent_line = None;
        for frame in frames {
            let key = NodeKey {
                identity: NodeIdentity {
                    declaring_type: frame.declaring_type.clone(),
                    method: frame.method.clone(),
                    disambiguator: disambiguator.disambiguate(frame),
                },
                parent_line: match mode {
                    MergeMode::SameMethod => None,
                    MergeMode::SeparateParentCalls => parent_line,
                },
            };
            current = self.find_or_create(current, key);
            self.nodes[current.0].record(interval);
            parent_line = frame.line;
        }
        self.nodes[current.0].self_time += interval;
    }

    /// Nested, serializable form of the tree.
    #[must_use]
    pub fn export(&self) -> ExportedTree {
        let root = self.root();
        ExportedTree {
            group: self.group.clone(),
            sample_count: root.sample_count,
            total_time_ms: duration_ms(root.total_time),
            children: self.export_children(NodeId::ROOT),
        }
    }

    fn export_children(&self, id: NodeId) -> Vec<ExportedNode> {
        self.nodes[id.0]
            .children
            .values()
            .map(|&child| {
                let node = &self.nodes[child.0];
                ExportedNode {
                    declaring_type: node.key.identity.declaring_type.clone(),
                    method: node.key.identity.method.clone(),
                    disambiguator: node.key.identity.disambiguator,
                    parent_line: node.key.parent_line,
                    sample_count: node.sample_count,
                    self_time_ms: duration_ms(node.self_time),
                    total_time_ms: duration_ms(node.total_time),
                    children: self.export_children(child),
                }
            })
            .collect()
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// =============================================================================
// Export form
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedTree {
    pub group: String,
    pub sample_count: u64,
    pub total_time_ms: f64,
    pub children: Vec<ExportedNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedNode {
    pub declaring_type: String,
    pub method: String,
    pub disambiguator: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_line: Option<u32>,
    pub sample_count: u64,
    pub self_time_ms: f64,
    pub total_time_ms: f64,
    pub children: Vec<ExportedNode>,
}

/// A method ranked by accumulated self time across every tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub declaring_type: String,
    pub method: String,
    pub self_time_ms: f64,
    pub sample_count: u64,
}

// =============================================================================
// CallTreeMerger
// =============================================================================

/// Merges capture snapshots into one tree per group key.
#[derive(Debug, Clone)]
pub struct CallTreeMerger {
    mode: MergeMode,
    grouping: ThreadGrouping,
    disambiguator: MethodDisambiguator,
    trees: BTreeMap<String, CallTree>,
    captures: u64,
}

impl CallTreeMerger {
    #[must_use]
    pub fn new(mode: MergeMode, grouping: ThreadGrouping) -> Self {
        Self {
            mode,
            grouping,
            disambiguator: MethodDisambiguator::new(),
            trees: BTreeMap::new(),
            captures: 0,
        }
    }

    #[must_use]
    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    #[must_use]
    pub fn grouping(&self) -> ThreadGrouping {
        self.grouping
    }

    /// Merge one thread's stack, attributing `interval` of time to it.
    pub fn merge_snapshot(&mut self, snapshot: &CaptureSnapshot, interval: Duration) {
        let key = self.grouping.group_key(&snapshot.thread_name);
        let tree = self
            .trees
            .entry(key)
            .or_insert_with_key(|k| CallTree::new(k.clone()));
        tree.merge_stack(&snapshot.frames, self.mode, &mut self.disambiguator, interval);
    }

    /// Merge every thread of one capture tick.
    pub fn merge_capture(&mut self, snapshots: &[CaptureSnapshot], interval: Duration) {
        for snapshot in snapshots {
            self.merge_snapshot(snapshot, interval);
        }
        self.captures += 1;
    }

    /// Merge a batch of buffered captures in order.
    pub fn absorb(&mut self, captures: &[(Vec<CaptureSnapshot>, Duration)]) {
        for (snapshots, interval) in captures {
            self.merge_capture(snapshots, *interval);
        }
    }

    /// Capture ticks merged so far.
    #[must_use]
    pub fn capture_count(&self) -> u64 {
        self.captures
    }

    #[must_use]
    pub fn tree(&self, group: &str) -> Option<&CallTree> {
        self.trees.get(group)
    }

    pub fn trees(&self) -> impl Iterator<Item = &CallTree> {
        self.trees.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    #[must_use]
    pub fn export(&self) -> Vec<ExportedTree> {
        self.trees.values().map(CallTree::export).collect()
    }

    /// Top `limit` methods by self time, summed over every tree and call path.
    #[must_use]
    pub fn hotspots(&self, limit: usize) -> Vec<Hotspot> {
        let mut by_method: BTreeMap<(&str, &str), (Duration, u64)> = BTreeMap::new();
        for tree in self.trees.values() {
            for (id, node) in tree.nodes() {
                if id == NodeId::ROOT || node.self_time.is_zero() {
                    continue;
                }
                let entry = by_method
                    .entry((
                        node.key.identity.declaring_type.as_str(),
                        node.key.identity.method.as_str(),
                    ))
                    .or_default();
                entry.0 += node.self_time;
                entry.1 += node.sample_count;
            }
        }
        let mut ranked: Vec<_> = by_method.into_iter().collect();
        // stable sort keeps name order for ties
        ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0));
        ranked
            .into_iter()
            .take(limit)
            .map(|((declaring_type, method), (self_time, sample_count))| Hotspot {
                declaring_type: declaring_type.to_string(),
                method: method.to_string(),
                self_time_ms: duration_ms(self_time),
                sample_count,
            })
            .collect()
    }
}
