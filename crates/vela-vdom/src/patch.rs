#![forbid(unsafe_code)]

//! Patch records produced by [`diff`](crate::diff) and consumed by
//! [`LiveTree::apply_patches`](crate::LiveTree::apply_patches).
//!
//! Every patch carries the pre-order index of the old-tree position it
//! applies to. The live node and event context are unknown at diff time;
//! the live tree fills them in during its locate pass, right before the
//! patches run.

use std::rc::Rc;

use serde_json::Value;

use crate::document::{Document, NodeId};
use crate::live::EventNode;
use crate::node::{Handler, Node, TaggerStack};

/// Host-side update for a custom node. Returns the node that now stands in
/// the custom node's place.
pub type CustomPatch = Rc<dyn Fn(&mut dyn Document, NodeId) -> NodeId>;

/// One change to the live tree.
#[derive(Clone)]
pub struct Patch {
    /// Pre-order index of the affected node in the old tree.
    pub index: usize,
    pub kind: PatchKind,
    pub(crate) target: Option<NodeId>,
    pub(crate) event_node: Option<Rc<EventNode>>,
}

impl Patch {
    pub(crate) fn new(index: usize, kind: PatchKind) -> Self {
        Self {
            index,
            kind,
            target: None,
            event_node: None,
        }
    }

    /// The live node this patch was bound to by the locate pass.
    pub fn target(&self) -> Option<NodeId> {
        self.target
    }
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patch")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .finish()
    }
}

/// What a patch does.
#[derive(Clone)]
pub enum PatchKind {
    /// Replace the node with a freshly rendered one.
    Redraw(Node),
    /// Apply a thunk's inner patches, indexed from the thunk's own subtree.
    Thunk(Vec<Patch>),
    /// Replace the message transformations of a tagger, outermost first.
    Tagger(TaggerStack),
    /// Replace the content of a text node.
    Text(String),
    /// Apply fact changes.
    Facts(FactsDiff),
    /// Remove `count` children starting at position `from`.
    RemoveLast { from: usize, count: usize },
    /// Render and append `children`; `from` is the first new position.
    Append { from: usize, children: Vec<Node> },
    /// Keyed children changes.
    Reorder(Reorder),
    /// Remove a keyed child. When the child moves instead, the move carries
    /// the patches to apply to it before it is reinserted.
    Remove(Option<Move>),
    /// Host update for a custom node.
    Custom(CustomPatch),
}

impl std::fmt::Debug for PatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redraw(node) => f.debug_tuple("Redraw").field(node).finish(),
            Self::Thunk(patches) => f.debug_tuple("Thunk").field(patches).finish(),
            Self::Tagger(taggers) => f.debug_tuple("Tagger").field(&taggers.len()).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Facts(diff) => f.debug_tuple("Facts").field(diff).finish(),
            Self::RemoveLast { from, count } => f
                .debug_struct("RemoveLast")
                .field("from", from)
                .field("count", count)
                .finish(),
            Self::Append { from, children } => f
                .debug_struct("Append")
                .field("from", from)
                .field("children", &children.len())
                .finish(),
            Self::Reorder(reorder) => f.debug_tuple("Reorder").field(reorder).finish(),
            Self::Remove(mv) => f.debug_tuple("Remove").field(mv).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Keyed-children changes for one parent.
#[derive(Clone, Debug, Default)]
pub struct Reorder {
    /// In-place child patches and removals, in old-tree order.
    pub patches: Vec<Patch>,
    /// Insertions at a final position, ascending.
    pub inserts: Vec<Insert>,
    /// Insertions after every other child, in order. `None` when the new
    /// list did not outrun the old one.
    pub end_inserts: Option<Vec<Insert>>,
    /// Key bookkeeping shared by inserts and moves.
    pub entries: Vec<Entry>,
}

impl Reorder {
    pub(crate) fn is_noop(&self) -> bool {
        self.patches.is_empty() && self.inserts.is_empty() && self.end_inserts.is_none()
    }

    /// Keys that end up inserted (new or moved), in application order.
    pub fn inserted_keys(&self) -> impl Iterator<Item = &str> {
        self.inserts
            .iter()
            .chain(self.end_inserts.iter().flatten())
            .filter_map(|ins| self.entries.get(ins.entry))
            .map(|entry| entry.key.as_str())
    }

    /// Keys whose nodes move rather than being created or destroyed.
    pub fn moved_keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Move)
            .map(|e| e.key.as_str())
    }
}

/// A node to place among the keyed children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Insert {
    /// Final child position, or `None` for end insertions.
    pub index: Option<usize>,
    /// Index into [`Reorder::entries`].
    pub entry: usize,
}

/// A keyed child whose fate spans several patches.
#[derive(Clone, Debug)]
pub struct Entry {
    pub key: String,
    pub kind: EntryKind,
    /// The node to render for inserts and moves (the new version), or the
    /// removed node for plain removals.
    pub node: Node,
    /// Old-tree index while the entry is a removal; final position once it
    /// has been inserted.
    pub index: Option<usize>,
    pub(crate) removal: Option<usize>,
    pub(crate) live: Option<NodeId>,
}

/// Bookkeeping state of an [`Entry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Insert,
    Remove,
    Move,
}

/// A removal that is really a move.
#[derive(Clone, Debug)]
pub struct Move {
    /// Patches for the moved node, indexed from its old position.
    pub patches: Vec<Patch>,
    /// Index into the owning [`Reorder::entries`].
    pub entry: usize,
}

/// Changes to a node's facts. `None` removes the key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FactsDiff {
    pub properties: Vec<(String, Option<Value>)>,
    pub attributes: Vec<(String, Option<String>)>,
    /// `(key, namespace, value)`.
    pub namespaced: Vec<(String, String, Option<String>)>,
    pub styles: Vec<(String, Option<String>)>,
    pub events: Vec<(String, Option<Handler>)>,
}

impl FactsDiff {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
            && self.attributes.is_empty()
            && self.namespaced.is_empty()
            && self.styles.is_empty()
            && self.events.is_empty()
    }
}
