//! Divergence index: a fixed-shape hash tree per entity over the change log.
//!
//! Each entity gets a 16-ary tree of `depth` levels below the root. A change
//! lands in the leaf picked by the leading nibbles of BLAKE3(change id), so
//! the tree shape depends only on which changes exist, never on the order
//! they arrived. Leaf hash = hash of its sorted `(change id, content hash)`
//! pairs; an internal node hashes its 16 children; an empty subtree hashes
//! to all zeroes.
//!
//! Appends update one leaf and the `depth` nodes above it. Two replicas find
//! what differs by descending only where hashes disagree, one level per
//! round trip (`Descent`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use tandem_chunks::{hash_bytes, hash_from_hex, hash_parts, hash_to_hex, zero_hash, Hash};
use tandem_core::{ChangeId, EntityId, TandemError, TandemResult};

use crate::change::Change;

pub const FANOUT: u32 = 16;
pub const MAX_DEPTH: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub level: u8,
    pub index: u32,
}

impl NodeId {
    pub const ROOT: NodeId = NodeId { level: 0, index: 0 };

    pub fn child(&self, k: u32) -> NodeId {
        NodeId {
            level: self.level + 1,
            index: self.index * FANOUT + k,
        }
    }

    fn parent(&self) -> NodeId {
        NodeId {
            level: self.level - 1,
            index: self.index / FANOUT,
        }
    }

    /// Leaf indices covered by this node in a tree of `depth`.
    fn leaf_span(&self, depth: u8) -> Range<u32> {
        let width = FANOUT.pow(u32::from(depth.saturating_sub(self.level)));
        self.index * width..(self.index + 1) * width
    }
}

/// One node of a peer's tree, as sent in `IndexNodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNode {
    pub node: NodeId,
    pub content: NodeContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeContent {
    /// Hex hashes of the 16 children
    Children { hashes: Vec<String> },
    /// Change ids stored in a leaf
    Leaf { changes: Vec<ChangeId> },
}

// ── Per-entity tree ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct EntityTree {
    depth: u8,
    leaves: HashMap<u32, BTreeMap<ChangeId, Hash>>,
    /// Non-empty node hashes (leaves included)
    nodes: HashMap<NodeId, Hash>,
    count: usize,
}

impl EntityTree {
    fn new(depth: u8) -> Self {
        EntityTree {
            depth,
            leaves: HashMap::new(),
            nodes: HashMap::new(),
            count: 0,
        }
    }

    fn insert(&mut self, id: &ChangeId, content: Hash) -> bool {
        let leaf = leaf_index(id, self.depth);
        let entries = self.leaves.entry(leaf).or_default();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.clone(), content);
        self.count += 1;

        let mut node = NodeId {
            level: self.depth,
            index: leaf,
        };
        let leaf_hash = hash_leaf(entries);
        self.nodes.insert(node, leaf_hash);
        while node.level > 0 {
            node = node.parent();
            let h = hash_children(&self.children(node));
            if h == zero_hash() {
                self.nodes.remove(&node);
            } else {
                self.nodes.insert(node, h);
            }
        }
        true
    }

    fn hash(&self, node: NodeId) -> Hash {
        self.nodes.get(&node).copied().unwrap_or_else(zero_hash)
    }

    fn children(&self, node: NodeId) -> Vec<Hash> {
        (0..FANOUT).map(|k| self.hash(node.child(k))).collect()
    }

    fn leaf_ids(&self, index: u32) -> BTreeSet<ChangeId> {
        self.leaves
            .get(&index)
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn ids_under(&self, node: NodeId) -> Vec<ChangeId> {
        let span = node.leaf_span(self.depth);
        self.leaves
            .iter()
            .filter(|(i, _)| span.contains(*i))
            .flat_map(|(_, e)| e.keys().cloned())
            .collect()
    }

    fn describe(&self, node: NodeId) -> IndexNode {
        let content = if node.level >= self.depth {
            NodeContent::Leaf {
                changes: self.leaf_ids(node.index).into_iter().collect(),
            }
        } else {
            NodeContent::Children {
                hashes: self.children(node).iter().map(hash_to_hex).collect(),
            }
        };
        IndexNode { node, content }
    }
}

fn leaf_index(id: &ChangeId, depth: u8) -> u32 {
    let digest = hash_bytes(id.to_string().as_bytes());
    let bytes = digest.as_bytes();
    (0..usize::from(depth)).fold(0u32, |acc, i| {
        let byte = bytes[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        acc * FANOUT + u32::from(nibble)
    })
}

fn hash_leaf(entries: &BTreeMap<ChangeId, Hash>) -> Hash {
    if entries.is_empty() {
        return zero_hash();
    }
    let parts: Vec<Vec<u8>> = entries
        .iter()
        .flat_map(|(id, h)| [id.to_string().into_bytes(), h.as_bytes().to_vec()])
        .collect();
    hash_parts(parts.iter().map(Vec::as_slice))
}

fn hash_children(children: &[Hash]) -> Hash {
    let zero = zero_hash();
    if children.iter().all(|h| *h == zero) {
        return zero;
    }
    hash_parts(children.iter().map(|h| h.as_bytes().as_slice()))
}

// ── Index ─────────────────────────────────────────────────────────────────────

/// Derived from the change log and never authoritative: `build` over the
/// same changes always reproduces the same hashes.
#[derive(Debug, Clone)]
pub struct DivergenceIndex {
    depth: u8,
    trees: BTreeMap<EntityId, EntityTree>,
}

impl DivergenceIndex {
    pub fn new(depth: u8) -> Self {
        DivergenceIndex {
            depth: depth.clamp(1, MAX_DEPTH),
            trees: BTreeMap::new(),
        }
    }

    /// Summarize a whole log from scratch.
    pub fn build<'a, I>(depth: u8, changes: I) -> TandemResult<Self>
    where
        I: IntoIterator<Item = &'a Change>,
    {
        let mut index = DivergenceIndex::new(depth);
        for change in changes {
            index.insert(change)?;
        }
        Ok(index)
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Add a change. Returns `false` if it was already indexed.
    pub fn insert(&mut self, change: &Change) -> TandemResult<bool> {
        let content = change.content_hash()?;
        let depth = self.depth;
        Ok(self
            .trees
            .entry(change.entity.clone())
            .or_insert_with(|| EntityTree::new(depth))
            .insert(&change.id, content))
    }

    pub fn len(&self) -> usize {
        self.trees.values().map(|t| t.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn root_hash(&self, entity: &EntityId) -> Hash {
        self.trees
            .get(entity)
            .map_or_else(zero_hash, |t| t.hash(NodeId::ROOT))
    }

    /// Per-entity roots, as carried in `Hello`.
    pub fn root_hashes(&self) -> BTreeMap<EntityId, String> {
        self.trees
            .iter()
            .map(|(e, t)| (e.clone(), hash_to_hex(&t.hash(NodeId::ROOT))))
            .collect()
    }

    /// Hash of the sorted `(entity, root)` list; all zeroes for an empty log.
    pub fn combined_root(&self) -> Hash {
        if self.trees.is_empty() {
            return zero_hash();
        }
        let parts: Vec<Vec<u8>> = self
            .trees
            .iter()
            .flat_map(|(e, t)| {
                [
                    e.as_str().as_bytes().to_vec(),
                    t.hash(NodeId::ROOT).as_bytes().to_vec(),
                ]
            })
            .collect();
        hash_parts(parts.iter().map(Vec::as_slice))
    }

    /// Answer a peer's `IndexQuery`.
    pub fn answer(&self, entity: &EntityId, nodes: &[NodeId]) -> Vec<IndexNode> {
        let empty = EntityTree::new(self.depth);
        let tree = self.trees.get(entity).unwrap_or(&empty);
        nodes
            .iter()
            .filter(|n| n.level <= self.depth)
            .map(|n| tree.describe(*n))
            .collect()
    }

    /// Every change id indexed for `entity`.
    pub fn entity_changes(&self, entity: &EntityId) -> Vec<ChangeId> {
        self.trees
            .get(entity)
            .map(|t| t.ids_under(NodeId::ROOT))
            .unwrap_or_default()
    }

    fn node_hash(&self, entity: &EntityId, node: NodeId) -> Hash {
        self.trees
            .get(entity)
            .map_or_else(zero_hash, |t| t.hash(node))
    }

    fn ids_under(&self, entity: &EntityId, node: NodeId) -> Vec<ChangeId> {
        self.trees
            .get(entity)
            .map(|t| t.ids_under(node))
            .unwrap_or_default()
    }

    fn leaf_ids(&self, entity: &EntityId, index: u32) -> BTreeSet<ChangeId> {
        self.trees
            .get(entity)
            .map(|t| t.leaf_ids(index))
            .unwrap_or_default()
    }

    /// Compare against another in-process index.
    pub fn diff(&self, remote: &DivergenceIndex) -> TandemResult<IndexDiff> {
        let (mut descent, mut queries) = Descent::start(self, &remote.root_hashes())?;
        while let Some((entity, nodes)) = queries.pop() {
            let answer = remote.answer(&entity, &nodes);
            if let Some(next) = descent.on_nodes(self, &entity, &answer)? {
                queries.push((entity, next));
            }
        }
        Ok(descent.finish())
    }
}

// ── Descent ───────────────────────────────────────────────────────────────────

/// Changes held by exactly one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    /// Present remotely, absent here
    pub missing_local: BTreeSet<ChangeId>,
    /// Present here, absent remotely
    pub missing_remote: BTreeSet<ChangeId>,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_local.is_empty() && self.missing_remote.is_empty()
    }
}

/// Walks a remote tree top-down, querying only subtrees whose hashes
/// differ from the local ones.
#[derive(Debug, Default)]
pub struct Descent {
    waiting: BTreeSet<EntityId>,
    diff: IndexDiff,
}

impl Descent {
    /// Compare roots and return the first round of queries.
    pub fn start(
        local: &DivergenceIndex,
        remote_roots: &BTreeMap<EntityId, String>,
    ) -> TandemResult<(Self, Vec<(EntityId, Vec<NodeId>)>)> {
        let mut descent = Descent::default();
        let mut queries = Vec::new();

        let entities: BTreeSet<&EntityId> =
            local.trees.keys().chain(remote_roots.keys()).collect();
        for entity in entities {
            let local_root = local.root_hash(entity);
            let remote_root = match remote_roots.get(entity) {
                Some(hex) => parse_hash(hex)?,
                None => zero_hash(),
            };
            if local_root == remote_root {
                continue;
            }
            if remote_root == zero_hash() {
                descent
                    .diff
                    .missing_remote
                    .extend(local.entity_changes(entity));
                continue;
            }
            descent.waiting.insert(entity.clone());
            queries.push((entity.clone(), vec![NodeId::ROOT]));
        }
        Ok((descent, queries))
    }

    /// Fold in one `IndexNodes` answer; returns the next query for this
    /// entity, if the descent continues.
    pub fn on_nodes(
        &mut self,
        local: &DivergenceIndex,
        entity: &EntityId,
        nodes: &[IndexNode],
    ) -> TandemResult<Option<Vec<NodeId>>> {
        if !self.waiting.remove(entity) {
            return Err(TandemError::Codec(format!(
                "unsolicited index nodes for {entity}"
            )));
        }

        let zero = zero_hash();
        let mut next = Vec::new();
        for IndexNode { node, content } in nodes {
            match content {
                NodeContent::Children { hashes } => {
                    if hashes.len() != FANOUT as usize {
                        return Err(TandemError::Codec(format!(
                            "index node {node:?} has {} children",
                            hashes.len()
                        )));
                    }
                    for (k, hex) in (0..FANOUT).zip(hashes) {
                        let child = node.child(k);
                        let remote = parse_hash(hex)?;
                        if remote == local.node_hash(entity, child) {
                            continue;
                        }
                        if remote == zero {
                            self.diff
                                .missing_remote
                                .extend(local.ids_under(entity, child));
                        } else {
                            next.push(child);
                        }
                    }
                }
                NodeContent::Leaf { changes } => {
                    let ours = local.leaf_ids(entity, node.index);
                    let theirs: BTreeSet<ChangeId> = changes.iter().cloned().collect();
                    self.diff
                        .missing_local
                        .extend(theirs.difference(&ours).cloned());
                    self.diff
                        .missing_remote
                        .extend(ours.difference(&theirs).cloned());
                }
            }
        }

        if next.is_empty() {
            Ok(None)
        } else {
            self.waiting.insert(entity.clone());
            Ok(Some(next))
        }
    }

    pub fn is_done(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn finish(self) -> IndexDiff {
        self.diff
    }
}

fn parse_hash(hex: &str) -> TandemResult<Hash> {
    hash_from_hex(hex).map_err(|e| TandemError::Codec(e.to_string()))
}

#[cfg(test)]
mod proptest_suite {
    use super::*;
    use crate::change::Operation;
    use proptest::prelude::*;
    use tandem_core::ActorId;

    fn change(actor: u8, seq: u64, entity: u8) -> Change {
        Change {
            id: ChangeId::new(ActorId::new(format!("actor-{actor}")), seq),
            deps: BTreeSet::new(),
            entity: EntityId::new(format!("e{entity}")),
            op: Operation::Delete,
            timestamp: seq,
        }
    }

    fn arb_changes() -> impl Strategy<Value = Vec<Change>> {
        prop::collection::btree_set((0u8..4, 1u64..40, 0u8..3), 0..60).prop_map(|s| {
            s.into_iter()
                .map(|(a, seq, e)| change(a, seq, e))
                // one entity per change id
                .fold(BTreeMap::new(), |mut m, c| {
                    m.entry(c.id.clone()).or_insert(c);
                    m
                })
                .into_values()
                .collect()
        })
    }

    proptest! {
        #[test]
        fn order_independent(changes in arb_changes(), seed in any::<u64>()) {
            let mut shuffled = changes.clone();
            // deterministic rotate + reverse as a cheap shuffle
            if !shuffled.is_empty() {
                let k = (seed as usize) % shuffled.len();
                shuffled.rotate_left(k);
            }
            shuffled.reverse();
            let a = DivergenceIndex::build(2, &changes).unwrap();
            let b = DivergenceIndex::build(2, &shuffled).unwrap();
            prop_assert_eq!(a.combined_root(), b.combined_root());
            prop_assert_eq!(a.root_hashes(), b.root_hashes());
        }

        #[test]
        fn diff_is_exact(changes in arb_changes(), split in prop::collection::vec(0u8..3, 60)) {
            // 0 = both sides, 1 = local only, 2 = remote only
            let mut local = DivergenceIndex::new(2);
            let mut remote = DivergenceIndex::new(2);
            let mut expect = IndexDiff::default();
            for (c, side) in changes.iter().zip(split) {
                match side {
                    0 => { local.insert(c).unwrap(); remote.insert(c).unwrap(); }
                    1 => { local.insert(c).unwrap(); expect.missing_remote.insert(c.id.clone()); }
                    _ => { remote.insert(c).unwrap(); expect.missing_local.insert(c.id.clone()); }
                }
            }
            let diff = local.diff(&remote).unwrap();
            prop_assert_eq!(&diff, &expect);
            prop_assert_eq!(diff.is_empty(), local.combined_root() == remote.combined_root());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use tandem_core::ActorId;

    fn change(actor: &str, seq: u64, entity: &str) -> Change {
        Change {
            id: ChangeId::new(ActorId::new(actor), seq),
            deps: BTreeSet::new(),
            entity: EntityId::new(entity),
            op: Operation::Delete,
            timestamp: 7,
        }
    }

    #[test]
    fn empty_index_has_zero_root() {
        let index = DivergenceIndex::new(3);
        assert_eq!(index.combined_root(), zero_hash());
        assert!(index.root_hashes().is_empty());
    }

    #[test]
    fn one_extra_change_moves_the_root() {
        let mut a = DivergenceIndex::new(3);
        let mut b = DivergenceIndex::new(3);
        for seq in 1..=20 {
            a.insert(&change("x", seq, "s")).unwrap();
            b.insert(&change("x", seq, "s")).unwrap();
        }
        assert_eq!(a.combined_root(), b.combined_root());
        b.insert(&change("y", 1, "s")).unwrap();
        assert_ne!(a.combined_root(), b.combined_root());
        assert_ne!(a.root_hash(&EntityId::new("s")), b.root_hash(&EntityId::new("s")));
    }

    #[test]
    fn same_id_different_content_changes_hash() {
        let mut a = DivergenceIndex::new(2);
        let mut b = DivergenceIndex::new(2);
        let c = change("x", 1, "s");
        let mut tampered = c.clone();
        tampered.timestamp += 1;
        a.insert(&c).unwrap();
        b.insert(&tampered).unwrap();
        assert_ne!(a.combined_root(), b.combined_root());
    }

    #[test]
    fn reinsert_is_noop() {
        let mut index = DivergenceIndex::new(3);
        let c = change("x", 1, "s");
        assert!(index.insert(&c).unwrap());
        let root = index.combined_root();
        assert!(!index.insert(&c).unwrap());
        assert_eq!(index.combined_root(), root);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn rebuild_matches_incremental() {
        let changes: Vec<Change> = (1..=50).map(|s| change("x", s, "s")).collect();
        let mut incremental = DivergenceIndex::new(3);
        for c in &changes {
            incremental.insert(c).unwrap();
        }
        let rebuilt = DivergenceIndex::build(3, changes.iter().rev()).unwrap();
        assert_eq!(incremental.combined_root(), rebuilt.combined_root());
    }

    #[test]
    fn diff_finds_single_missing_change() {
        let mut a = DivergenceIndex::new(3);
        let mut b = DivergenceIndex::new(3);
        for seq in 1..=100 {
            a.insert(&change("x", seq, "s")).unwrap();
            b.insert(&change("x", seq, "s")).unwrap();
        }
        a.insert(&change("x", 101, "s")).unwrap();
        b.insert(&change("y", 1, "other")).unwrap();

        let diff = a.diff(&b).unwrap();
        assert_eq!(
            diff.missing_remote,
            BTreeSet::from([ChangeId::new(ActorId::new("x"), 101)])
        );
        assert_eq!(
            diff.missing_local,
            BTreeSet::from([ChangeId::new(ActorId::new("y"), 1)])
        );
    }

    #[test]
    fn answer_describes_leaves_and_children() {
        let mut index = DivergenceIndex::new(1);
        index.insert(&change("x", 1, "s")).unwrap();
        let entity = EntityId::new("s");

        let root = index.answer(&entity, &[NodeId::ROOT]);
        match &root[0].content {
            NodeContent::Children { hashes } => {
                assert_eq!(hashes.len(), 16);
                let empty = hash_to_hex(&zero_hash());
                assert_eq!(hashes.iter().filter(|h| **h != empty).count(), 1);
            }
            other => panic!("expected children, got {other:?}"),
        }

        let leaf = NodeId {
            level: 1,
            index: leaf_index(&ChangeId::new(ActorId::new("x"), 1), 1),
        };
        let answer = index.answer(&entity, &[leaf]);
        assert_eq!(
            answer[0].content,
            NodeContent::Leaf {
                changes: vec![ChangeId::new(ActorId::new("x"), 1)]
            }
        );
    }

    #[test]
    fn unsolicited_answer_is_rejected() {
        let local = DivergenceIndex::new(2);
        let mut descent = Descent::default();
        assert!(descent
            .on_nodes(&local, &EntityId::new("s"), &[])
            .is_err());
    }
}
