#![forbid(unsafe_code)]

//! The host document abstraction.
//!
//! The kernel never touches a real DOM. Everything it needs from the host is
//! expressed by the [`Document`] trait over opaque [`NodeId`] handles, and
//! [`MemoryDocument`] implements it with an arena so trees can be rendered,
//! patched and inspected in tests and on headless hosts.
//!
//! # Invariants
//!
//! 1. A node has at most one parent; inserting an attached node moves it.
//! 2. `MemoryDocument` never reuses a `NodeId`, so stale handles keep
//!    pointing at the (detached) node they were issued for.
//!
//! # Failure Modes
//!
//! - Operations on unknown handles are ignored by `MemoryDocument`. The
//!   live tree only issues them when it has lost sync with the document,
//!   which the patch locator reports instead.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Value;

/// Opaque handle to a host node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Options for a registered listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// The listener promises never to prevent the default action.
    pub passive: bool,
}

/// The mutable host tree the live tree renders into.
pub trait Document {
    fn create_text(&mut self, text: &str) -> NodeId;
    fn create_element(&mut self, tag: &str, namespace: Option<&str>) -> NodeId;

    fn contains(&self, node: NodeId) -> bool;
    fn is_element(&self, node: NodeId) -> bool;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn child(&self, parent: NodeId, index: usize) -> Option<NodeId>;
    fn child_count(&self, parent: NodeId) -> usize;

    /// Insert `child` before `reference`, or last when `reference` is
    /// `None`. An attached `child` is moved.
    fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>);
    fn remove_child(&mut self, parent: NodeId, child: NodeId);
    fn replace_child(&mut self, parent: NodeId, new_child: NodeId, old_child: NodeId);

    fn set_text(&mut self, node: NodeId, text: &str);
    fn set_property(&mut self, node: NodeId, key: &str, value: &Value);
    fn remove_property(&mut self, node: NodeId, key: &str);
    fn set_attribute(&mut self, node: NodeId, key: &str, value: &str);
    fn remove_attribute(&mut self, node: NodeId, key: &str);
    fn set_attribute_ns(&mut self, node: NodeId, namespace: &str, key: &str, value: &str);
    fn remove_attribute_ns(&mut self, node: NodeId, namespace: &str, key: &str);
    fn set_style(&mut self, node: NodeId, key: &str, value: &str);
    fn remove_style(&mut self, node: NodeId, key: &str);

    fn add_listener(&mut self, node: NodeId, event: &str, options: ListenerOptions);
    fn remove_listener(&mut self, node: NodeId, event: &str);
}

// ---------------------------------------------------------------------------
// MemoryDocument
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Content {
    Text(String),
    Element {
        tag: String,
        namespace: Option<String>,
    },
}

#[derive(Clone, Debug)]
struct MemoryNode {
    content: Content,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    properties: BTreeMap<String, Value>,
    attributes: BTreeMap<String, String>,
    namespaced: BTreeMap<(String, String), String>,
    styles: BTreeMap<String, String>,
    listeners: BTreeMap<String, ListenerOptions>,
}

impl MemoryNode {
    fn new(content: Content) -> Self {
        Self {
            content,
            parent: None,
            children: Vec::new(),
            properties: BTreeMap::new(),
            attributes: BTreeMap::new(),
            namespaced: BTreeMap::new(),
            styles: BTreeMap::new(),
            listeners: BTreeMap::new(),
        }
    }
}

/// Mutation counters, for asserting how much work a patch did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutationStats {
    pub created: usize,
    pub structural: usize,
    pub facts: usize,
    pub listeners_added: usize,
    pub listeners_removed: usize,
}

impl MutationStats {
    pub fn total(&self) -> usize {
        self.created + self.structural + self.facts + self.listeners_added + self.listeners_removed
    }
}

/// An arena-backed [`Document`].
#[derive(Clone, Debug, Default)]
pub struct MemoryDocument {
    nodes: Vec<MemoryNode>,
    stats: MutationStats,
}

/// A structural snapshot of a subtree, comparable across documents.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot {
    Text(String),
    Element {
        tag: String,
        namespace: Option<String>,
        properties: BTreeMap<String, Value>,
        attributes: BTreeMap<String, String>,
        namespaced: BTreeMap<(String, String), String>,
        styles: BTreeMap<String, String>,
        listeners: BTreeMap<String, ListenerOptions>,
        children: Vec<Snapshot>,
    },
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detached element to mount into.
    pub fn create_root(&mut self, tag: &str) -> NodeId {
        self.create_element(tag, None)
    }

    pub fn stats(&self) -> MutationStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = MutationStats::default();
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.node(node)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    pub fn text(&self, node: NodeId) -> Option<&str> {
        match &self.node(node)?.content {
            Content::Text(text) => Some(text),
            Content::Element { .. } => None,
        }
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match &self.node(node)?.content {
            Content::Element { tag, .. } => Some(tag),
            Content::Text(_) => None,
        }
    }

    pub fn attribute(&self, node: NodeId, key: &str) -> Option<&str> {
        self.node(node)?.attributes.get(key).map(String::as_str)
    }

    pub fn property(&self, node: NodeId, key: &str) -> Option<&Value> {
        self.node(node)?.properties.get(key)
    }

    pub fn style(&self, node: NodeId, key: &str) -> Option<&str> {
        self.node(node)?.styles.get(key).map(String::as_str)
    }

    pub fn listener(&self, node: NodeId, event: &str) -> Option<ListenerOptions> {
        self.node(node)?.listeners.get(event).copied()
    }

    /// Depth-first search for the first element with `tag`.
    pub fn find_tag(&self, root: NodeId, tag: &str) -> Option<NodeId> {
        if self.tag(root) == Some(tag) {
            return Some(root);
        }
        self.children(root)
            .iter()
            .find_map(|&child| self.find_tag(child, tag))
    }

    /// Depth-first search for the element whose `id` attribute matches.
    pub fn find_id(&self, root: NodeId, id: &str) -> Option<NodeId> {
        if self.attribute(root, "id") == Some(id) {
            return Some(root);
        }
        self.children(root)
            .iter()
            .find_map(|&child| self.find_id(child, id))
    }

    /// Structural snapshot of the subtree rooted at `node`.
    pub fn snapshot(&self, node: NodeId) -> Option<Snapshot> {
        let n = self.node(node)?;
        Some(match &n.content {
            Content::Text(text) => Snapshot::Text(text.clone()),
            Content::Element { tag, namespace } => Snapshot::Element {
                tag: tag.clone(),
                namespace: namespace.clone(),
                properties: n.properties.clone(),
                attributes: n.attributes.clone(),
                namespaced: n.namespaced.clone(),
                styles: n.styles.clone(),
                listeners: n.listeners.clone(),
                children: n
                    .children
                    .iter()
                    .filter_map(|&c| self.snapshot(c))
                    .collect(),
            },
        })
    }

    /// HTML-like rendering of the subtree, showing tags, attributes and
    /// text. Properties, styles and listeners are left out.
    pub fn markup(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_markup(node, &mut out);
        out
    }

    /// Concatenated text content of the subtree.
    pub fn text_content(&self, node: NodeId) -> String {
        match self.node(node).map(|n| &n.content) {
            Some(Content::Text(text)) => text.clone(),
            Some(Content::Element { .. }) => self
                .children(node)
                .iter()
                .map(|&c| self.text_content(c))
                .collect(),
            None => String::new(),
        }
    }

    fn write_markup(&self, node: NodeId, out: &mut String) {
        let Some(n) = self.node(node) else {
            return;
        };
        match &n.content {
            Content::Text(text) => out.push_str(text),
            Content::Element { tag, .. } => {
                out.push('<');
                out.push_str(tag);
                for (key, value) in &n.attributes {
                    let _ = write!(out, " {key}=\"{value}\"");
                }
                out.push('>');
                for &child in &n.children {
                    self.write_markup(child, out);
                }
                let _ = write!(out, "</{tag}>");
            }
        }
    }

    fn node(&self, id: NodeId) -> Option<&MemoryNode> {
        self.nodes.get(id.0 as usize)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut MemoryNode> {
        self.nodes.get_mut(id.0 as usize)
    }

    fn push(&mut self, content: Content) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(MemoryNode::new(content));
        self.stats.created += 1;
        id
    }

    fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.node(child).and_then(|n| n.parent) else {
            return;
        };
        if let Some(p) = self.node_mut(parent) {
            p.children.retain(|&c| c != child);
        }
        if let Some(c) = self.node_mut(child) {
            c.parent = None;
        }
    }

    fn with_facts(&mut self, node: NodeId, f: impl FnOnce(&mut MemoryNode)) {
        if let Some(n) = self.node_mut(node) {
            f(n);
            self.stats.facts += 1;
        }
    }
}

impl Document for MemoryDocument {
    fn create_text(&mut self, text: &str) -> NodeId {
        self.push(Content::Text(text.to_owned()))
    }

    fn create_element(&mut self, tag: &str, namespace: Option<&str>) -> NodeId {
        self.push(Content::Element {
            tag: tag.to_owned(),
            namespace: namespace.map(str::to_owned),
        })
    }

    fn contains(&self, node: NodeId) -> bool {
        self.node(node).is_some()
    }

    fn is_element(&self, node: NodeId) -> bool {
        matches!(
            self.node(node).map(|n| &n.content),
            Some(Content::Element { .. })
        )
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node)?.parent
    }

    fn child(&self, parent: NodeId, index: usize) -> Option<NodeId> {
        self.node(parent)?.children.get(index).copied()
    }

    fn child_count(&self, parent: NodeId) -> usize {
        self.node(parent).map_or(0, |n| n.children.len())
    }

    fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        if !self.contains(parent) || !self.contains(child) || parent == child {
            return;
        }
        self.detach(child);
        if let Some(p) = self.node_mut(parent) {
            let at = reference
                .and_then(|r| p.children.iter().position(|&c| c == r))
                .unwrap_or(p.children.len());
            p.children.insert(at, child);
        }
        if let Some(c) = self.node_mut(child) {
            c.parent = Some(parent);
        }
        self.stats.structural += 1;
    }

    fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        if self.parent(child) == Some(parent) {
            self.detach(child);
            self.stats.structural += 1;
        }
    }

    fn replace_child(&mut self, parent: NodeId, new_child: NodeId, old_child: NodeId) {
        if self.parent(old_child) != Some(parent) || new_child == old_child {
            return;
        }
        self.detach(new_child);
        if let Some(p) = self.node_mut(parent)
            && let Some(slot) = p.children.iter_mut().find(|c| **c == old_child)
        {
            *slot = new_child;
        }
        if let Some(n) = self.node_mut(new_child) {
            n.parent = Some(parent);
        }
        if let Some(o) = self.node_mut(old_child) {
            o.parent = None;
        }
        self.stats.structural += 1;
    }

    fn set_text(&mut self, node: NodeId, text: &str) {
        self.with_facts(node, |n| {
            if let Content::Text(t) = &mut n.content {
                text.clone_into(t);
            }
        });
    }

    fn set_property(&mut self, node: NodeId, key: &str, value: &Value) {
        self.with_facts(node, |n| {
            n.properties.insert(key.to_owned(), value.clone());
        });
    }

    fn remove_property(&mut self, node: NodeId, key: &str) {
        self.with_facts(node, |n| {
            n.properties.remove(key);
        });
    }

    fn set_attribute(&mut self, node: NodeId, key: &str, value: &str) {
        self.with_facts(node, |n| {
            n.attributes.insert(key.to_owned(), value.to_owned());
        });
    }

    fn remove_attribute(&mut self, node: NodeId, key: &str) {
        self.with_facts(node, |n| {
            n.attributes.remove(key);
        });
    }

    fn set_attribute_ns(&mut self, node: NodeId, namespace: &str, key: &str, value: &str) {
        self.with_facts(node, |n| {
            n.namespaced
                .insert((namespace.to_owned(), key.to_owned()), value.to_owned());
        });
    }

    fn remove_attribute_ns(&mut self, node: NodeId, namespace: &str, key: &str) {
        self.with_facts(node, |n| {
            n.namespaced.remove(&(namespace.to_owned(), key.to_owned()));
        });
    }

    fn set_style(&mut self, node: NodeId, key: &str, value: &str) {
        self.with_facts(node, |n| {
            n.styles.insert(key.to_owned(), value.to_owned());
        });
    }

    fn remove_style(&mut self, node: NodeId, key: &str) {
        self.with_facts(node, |n| {
            n.styles.remove(key);
        });
    }

    fn add_listener(&mut self, node: NodeId, event: &str, options: ListenerOptions) {
        if let Some(n) = self.node_mut(node) {
            n.listeners.insert(event.to_owned(), options);
            self.stats.listeners_added += 1;
        }
    }

    fn remove_listener(&mut self, node: NodeId, event: &str) {
        if let Some(n) = self.node_mut(node)
            && n.listeners.remove(event).is_some()
        {
            self.stats.listeners_removed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_moves_attached_nodes() {
        let mut doc = MemoryDocument::new();
        let a = doc.create_root("a");
        let b = doc.create_root("b");
        let t = doc.create_text("x");
        doc.insert_before(a, t, None);
        doc.insert_before(b, t, None);
        assert_eq!(doc.child_count(a), 0);
        assert_eq!(doc.children(b), &[t]);
        assert_eq!(doc.parent(t), Some(b));
    }

    #[test]
    fn insert_before_reference() {
        let mut doc = MemoryDocument::new();
        let root = doc.create_root("ul");
        let one = doc.create_text("1");
        let three = doc.create_text("3");
        let two = doc.create_text("2");
        doc.insert_before(root, one, None);
        doc.insert_before(root, three, None);
        doc.insert_before(root, two, Some(three));
        assert_eq!(doc.text_content(root), "123");
    }

    #[test]
    fn replace_and_markup() {
        let mut doc = MemoryDocument::new();
        let root = doc.create_root("div");
        let old = doc.create_text("old");
        doc.insert_before(root, old, None);
        let span = doc.create_element("span", None);
        doc.set_attribute(span, "class", "x");
        doc.replace_child(root, span, old);
        assert_eq!(doc.markup(root), "<div><span class=\"x\"></span></div>");
        assert_eq!(doc.parent(old), None);
    }

    #[test]
    fn unknown_handles_are_ignored() {
        let mut doc = MemoryDocument::new();
        let ghost = NodeId::from_raw(42);
        doc.set_text(ghost, "x");
        doc.insert_before(ghost, ghost, None);
        assert!(!doc.contains(ghost));
        assert_eq!(doc.stats(), MutationStats::default());
    }
}
