//! Per-thread call trees built from stack samples.
//!
//! Samples are walked from the bottom of the call stack to the leaf. Each
//! depth looks up its child by [`FrameIdentity`], creating it on first sight,
//! and the leaf collects the sample's value and occurrence count. Cumulative
//! values are never cached: trees keep changing until they are exported, so
//! [`CallTreeNode::cumulative_value`] is recomputed on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::error::CallTreeError;
use crate::frame::{FrameId, FrameIdentity};
use crate::sample::StackSample;

/// Threads the runtime never named are reported with this label prefix.
const UNNAMED_THREAD_PREFIX: &str = "[tid=";

#[derive(Debug, Clone)]
pub struct CallTreeNode {
    frame: Arc<FrameIdentity>,
    self_value: u64,
    sample_count: u32,
    children: HashMap<Arc<FrameIdentity>, CallTreeNode>,
}

impl CallTreeNode {
    /// An empty node for `frame`.
    pub fn new(frame: Arc<FrameIdentity>) -> Self {
        Self {
            frame,
            self_value: 0,
            sample_count: 0,
            children: HashMap::new(),
        }
    }

    pub fn frame(&self) -> &Arc<FrameIdentity> {
        &self.frame
    }

    /// Value recorded with this frame as the leaf.
    pub fn self_value(&self) -> u64 {
        self.self_value
    }

    /// Occurrences recorded with this frame as the leaf.
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// The direct callee for `frame`, if it was ever sampled.
    pub fn child(&self, frame: &FrameIdentity) -> Option<&CallTreeNode> {
        self.children.get(frame)
    }

    /// Direct callees in no particular order. See [`Self::sorted_children`].
    pub fn children(&self) -> impl Iterator<Item = &CallTreeNode> {
        self.children.values()
    }

    fn child_or_insert(&mut self, frame: &Arc<FrameIdentity>) -> &mut CallTreeNode {
        self.children
            .entry(frame.clone())
            .or_insert_with(|| CallTreeNode::new(frame.clone()))
    }

    fn record(&mut self, value: u64, occurrences: u32) {
        self.self_value = self.self_value.saturating_add(value);
        self.sample_count = self.sample_count.saturating_add(occurrences);
    }

    /// This node's own value plus the cumulative value of every child.
    pub fn cumulative_value(&self) -> u64 {
        self.children
            .values()
            .fold(self.self_value, |acc, child| {
                acc.saturating_add(child.cumulative_value())
            })
    }

    /// Occurrences recorded anywhere in this subtree.
    pub fn cumulative_samples(&self) -> u64 {
        self.children
            .values()
            .fold(u64::from(self.sample_count), |acc, child| {
                acc + child.cumulative_samples()
            })
    }

    /// Children ordered cheapest subtree first. Ties fall back to the frame's
    /// display form so the order is the same on every export.
    pub fn sorted_children(&self) -> Vec<&CallTreeNode> {
        let mut children: Vec<(u64, String, &CallTreeNode)> = self
            .children
            .values()
            .map(|child| (child.cumulative_value(), child.frame.to_string(), child))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        children.into_iter().map(|(_, _, child)| child).collect()
    }

    /// Fold `other` into this node, summing matching descendants.
    ///
    /// Both nodes must be keyed by the same frame. `other` is consumed, so a
    /// node can never be merged into itself:
    ///
    /// ```compile_fail
    /// use std::sync::Arc;
    /// use kindling::calltree::CallTreeNode;
    /// use kindling::frame::FrameIdentity;
    ///
    /// let mut node = CallTreeNode::new(Arc::new(FrameIdentity::native("main")));
    /// node.merge(node).unwrap();
    /// ```
    pub fn merge(&mut self, other: CallTreeNode) -> Result<(), CallTreeError> {
        if self.frame != other.frame {
            return Err(CallTreeError::FrameMismatch {
                expected: self.frame.to_string(),
                found: other.frame.to_string(),
            });
        }
        self.merge_matching(other);
        Ok(())
    }

    fn merge_matching(&mut self, other: CallTreeNode) {
        self.record(other.self_value, other.sample_count);
        for (frame, child) in other.children {
            match self.children.get_mut(&frame) {
                Some(existing) => existing.merge_matching(child),
                None => {
                    self.children.insert(frame, child);
                }
            }
        }
    }
}

/// The call tree of one thread for one sample kind.
#[derive(Debug, Clone, Default)]
pub struct CallTree {
    roots: HashMap<Arc<FrameIdentity>, CallTreeNode>,
}

impl CallTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one stack. `frames` is leaf-first. Empty stacks are ignored.
    pub fn ingest(&mut self, frames: &[Arc<FrameIdentity>], value: u64, occurrences: u32) {
        let mut walk = frames.iter().rev();
        let Some(bottom) = walk.next() else {
            return;
        };
        let mut node = self
            .roots
            .entry(bottom.clone())
            .or_insert_with(|| CallTreeNode::new(bottom.clone()));
        for frame in walk {
            node = node.child_or_insert(frame);
        }
        node.record(value, occurrences);
    }

    pub fn merge(&mut self, other: CallTree) {
        for (frame, root) in other.roots {
            match self.roots.get_mut(&frame) {
                Some(existing) => existing.merge_matching(root),
                None => {
                    self.roots.insert(frame, root);
                }
            }
        }
    }

    pub fn root(&self, frame: &FrameIdentity) -> Option<&CallTreeNode> {
        self.roots.get(frame)
    }

    /// Roots in the same ascending order children are exported in.
    pub fn sorted_roots(&self) -> Vec<&CallTreeNode> {
        let mut roots: Vec<(u64, String, &CallTreeNode)> = self
            .roots
            .values()
            .map(|root| (root.cumulative_value(), root.frame.to_string(), root))
            .collect();
        roots.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        roots.into_iter().map(|(_, _, root)| root).collect()
    }

    pub fn cumulative_value(&self) -> u64 {
        self.roots
            .values()
            .fold(0u64, |acc, root| acc.saturating_add(root.cumulative_value()))
    }

    pub fn cumulative_samples(&self) -> u64 {
        self.roots.values().map(CallTreeNode::cumulative_samples).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Call trees for every thread seen during one window, keyed by thread label.
#[derive(Debug, Clone, Default)]
pub struct ThreadForest {
    threads: BTreeMap<String, CallTree>,
}

impl ThreadForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and ingest one sample.
    ///
    /// Returns false when the sample was dropped: unnamed threads, empty
    /// stacks, and stacks with a frame `resolve` does not know are skipped.
    pub fn ingest<F>(&mut self, sample: &StackSample, mut resolve: F) -> bool
    where
        F: FnMut(FrameId) -> Option<Arc<FrameIdentity>>,
    {
        if sample.thread_label.starts_with(UNNAMED_THREAD_PREFIX) || sample.frames.is_empty() {
            return false;
        }
        let mut frames = Vec::with_capacity(sample.frames.len());
        for &id in &sample.frames {
            match resolve(id) {
                Some(frame) => frames.push(frame),
                None => {
                    trace!(frame = id, thread = %sample.thread_label, "dropping sample with unknown frame");
                    return false;
                }
            }
        }
        self.threads
            .entry(sample.thread_label.clone())
            .or_default()
            .ingest(&frames, sample.value, sample.occurrences);
        true
    }

    pub fn merge(&mut self, other: ThreadForest) {
        for (thread, tree) in other.threads {
            self.threads.entry(thread).or_default().merge(tree);
        }
    }

    pub fn thread(&self, label: &str) -> Option<&CallTree> {
        self.threads.get(label)
    }

    /// Threads in label order.
    pub fn threads(&self) -> impl Iterator<Item = (&str, &CallTree)> {
        self.threads.iter().map(|(label, tree)| (label.as_str(), tree))
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn cumulative_value(&self) -> u64 {
        self.threads
            .values()
            .fold(0u64, |acc, tree| acc.saturating_add(tree.cumulative_value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(names: &[&str]) -> Vec<Arc<FrameIdentity>> {
        // Leaf-first, like the sample source reports them.
        names
            .iter()
            .rev()
            .map(|n| Arc::new(FrameIdentity::managed("app.Main", *n, "()V")))
            .collect()
    }

    fn m(name: &str) -> FrameIdentity {
        FrameIdentity::managed("app.Main", name, "()V")
    }

    #[test]
    fn test_scenario_two_branches() {
        let mut tree = CallTree::new();
        tree.ingest(&frames(&["A", "B"]), 100, 1);
        tree.ingest(&frames(&["A", "B"]), 50, 1);
        tree.ingest(&frames(&["A", "C"]), 30, 1);

        let a = tree.root(&m("A")).unwrap();
        assert_eq!(a.self_value(), 0);
        assert_eq!(a.cumulative_value(), 180);
        assert_eq!(a.child(&m("B")).unwrap().self_value(), 150);
        assert_eq!(a.child(&m("B")).unwrap().sample_count(), 2);
        assert_eq!(a.child(&m("C")).unwrap().self_value(), 30);
        assert_eq!(a.children().count(), 2);
    }

    #[test]
    fn test_conservation() {
        let stacks: Vec<(Vec<&str>, u64, u32)> = vec![
            (vec!["main", "run", "work"], 40, 2),
            (vec!["main", "run"], 7, 1),
            (vec!["main", "idle"], 13, 3),
            (vec!["bg", "poll"], 5, 1),
            (vec!["main", "run", "work", "hash"], 22, 4),
        ];
        let mut tree = CallTree::new();
        for (names, value, occurrences) in &stacks {
            tree.ingest(&frames(names), *value, *occurrences);
        }
        let total_value: u64 = stacks.iter().map(|s| s.1).sum();
        let total_occurrences: u64 = stacks.iter().map(|s| u64::from(s.2)).sum();
        assert_eq!(tree.cumulative_value(), total_value);
        assert_eq!(tree.cumulative_samples(), total_occurrences);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let first = [(vec!["A", "B"], 10), (vec!["A", "C", "D"], 4)];
        let second = [(vec!["A", "B"], 6), (vec!["A", "C"], 9), (vec!["E"], 1)];

        let build = |stacks: &[(Vec<&str>, u64)]| {
            let mut tree = CallTree::new();
            for (names, value) in stacks {
                tree.ingest(&frames(names), *value, 1);
            }
            tree
        };

        let mut ab = build(&first);
        ab.merge(build(&second));
        let mut ba = build(&second);
        ba.merge(build(&first));

        for tree in [&ab, &ba] {
            let a = tree.root(&m("A")).unwrap();
            assert_eq!(a.cumulative_value(), 29);
            assert_eq!(a.child(&m("B")).unwrap().cumulative_value(), 16);
            assert_eq!(a.child(&m("C")).unwrap().cumulative_value(), 13);
            assert_eq!(tree.root(&m("E")).unwrap().cumulative_value(), 1);
            assert_eq!(tree.cumulative_value(), 30);
        }
    }

    #[test]
    fn test_node_merge_rejects_different_frames() {
        let mut a = CallTreeNode::new(Arc::new(m("A")));
        let b = CallTreeNode::new(Arc::new(m("B")));
        let err = a.merge(b).unwrap_err();
        assert!(matches!(err, CallTreeError::FrameMismatch { .. }));

        let mut other = CallTreeNode::new(Arc::new(m("A")));
        other.record(5, 1);
        a.merge(other).unwrap();
        assert_eq!(a.self_value(), 5);
    }

    #[test]
    fn test_children_sorted_ascending() {
        let mut tree = CallTree::new();
        tree.ingest(&frames(&["root", "heavy"]), 500, 1);
        tree.ingest(&frames(&["root", "light"]), 3, 1);
        tree.ingest(&frames(&["root", "medium", "x"]), 40, 1);

        let root = tree.root(&m("root")).unwrap();
        let order: Vec<u64> = root
            .sorted_children()
            .iter()
            .map(|c| c.cumulative_value())
            .collect();
        assert_eq!(order, vec![3, 40, 500]);
    }

    #[test]
    fn test_forest_skips_unnamed_and_unresolved() {
        let table: HashMap<FrameId, Arc<FrameIdentity>> = [
            (1, Arc::new(m("leaf"))),
            (2, Arc::new(m("main"))),
        ]
        .into_iter()
        .collect();
        let resolve = |id: FrameId| table.get(&id).cloned();
        let sample = |thread: &str, frames: Vec<FrameId>| StackSample {
            thread_label: thread.to_string(),
            frames,
            value: 10,
            occurrences: 1,
        };

        let mut forest = ThreadForest::new();
        assert!(forest.ingest(&sample("main", vec![1, 2]), resolve));
        assert!(!forest.ingest(&sample("[tid=4242]", vec![1, 2]), resolve));
        assert!(!forest.ingest(&sample("main", vec![1, 99]), resolve));
        assert!(!forest.ingest(&sample("main", vec![]), resolve));

        assert_eq!(forest.len(), 1);
        let main = forest.thread("main").unwrap();
        let root = main.root(&m("main")).unwrap();
        assert_eq!(root.child(&m("leaf")).unwrap().self_value(), 10);
        assert_eq!(forest.cumulative_value(), 10);
    }

    #[test]
    fn test_forest_merge_by_thread() {
        let leaf = Arc::new(m("leaf"));
        let resolve = |_: FrameId| Some(leaf.clone());
        let sample = |thread: &str, value| StackSample {
            thread_label: thread.to_string(),
            frames: vec![1],
            value,
            occurrences: 1,
        };
        let mut cpu = ThreadForest::new();
        cpu.ingest(&sample("main", 5), resolve);
        let mut more = ThreadForest::new();
        more.ingest(&sample("main", 7), resolve);
        more.ingest(&sample("worker", 1), resolve);

        cpu.merge(more);
        let labels: Vec<&str> = cpu.threads().map(|(label, _)| label).collect();
        assert_eq!(labels, vec!["main", "worker"]);
        assert_eq!(cpu.thread("main").unwrap().cumulative_value(), 12);
    }
}
