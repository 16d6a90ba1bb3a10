#![forbid(unsafe_code)]

//! The live tree: virtual nodes realized in a [`Document`].
//!
//! [`LiveTree`] owns the document, remembers which handler sits on which
//! node, and knows the chain of message transformations (event nodes) that
//! applies below every tagger. It offers three operations:
//!
//! - **render**: build host nodes for a virtual subtree.
//! - **apply_patches**: bind each patch to its live node by walking the old
//!   virtual tree alongside the document (the locate pass), then run the
//!   patches in order.
//! - **dispatch**: deliver a host event at a node, bubbling to the root and
//!   routing every decoded message through the enclosing taggers.
//!
//! # Invariants
//!
//! 1. Before patching, the document subtree under the root mirrors the old
//!    virtual tree node for node, with taggers and thunks collapsed.
//! 2. A handler update that keeps its [`HandlerKind`] swaps the handler in
//!    place without touching the host listener.
//! 3. Keyed children are applied as removals and moves first, then indexed
//!    insertions in ascending position, then end insertions. A moved node
//!    is the same host node before and after.
//!
//! # Failure Modes
//!
//! - Patches the locate pass cannot bind (the document was edited behind
//!   the tree's back) are skipped and counted in [`PatchReport::unbound`].
//! - A handler whose decoder fails is skipped for that event; bubbling
//!   continues.
//! - A handler or tagger receiving a value of the wrong type is reported as
//!   [`DispatchError::HandlerTypeMismatch`].
//!
//! [`HandlerKind`]: crate::node::HandlerKind

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use serde_json::Value;

use crate::document::{Document, ListenerOptions, NodeId};
use crate::node::{Facts, Handler, Message, Node, TaggerStack, gather_taggers};
use crate::patch::{EntryKind, FactsDiff, Patch, PatchKind, Reorder};

// ---------------------------------------------------------------------------
// Event nodes
// ---------------------------------------------------------------------------

/// One level of message transformation, linked to its enclosing level.
#[derive(Debug)]
pub struct EventNode {
    taggers: RefCell<TaggerStack>,
    parent: Option<Rc<EventNode>>,
}

impl EventNode {
    /// The outermost level: messages pass through unchanged.
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            taggers: RefCell::new(TaggerStack::new()),
            parent: None,
        })
    }

    fn child(taggers: TaggerStack, parent: Rc<EventNode>) -> Rc<Self> {
        Rc::new(Self {
            taggers: RefCell::new(taggers),
            parent: Some(parent),
        })
    }

    /// Route a message outward through every enclosing tagger, innermost
    /// first. `None` when a tagger rejected the message's type.
    pub fn deliver(&self, message: Message) -> Option<Message> {
        let mut message = message;
        let mut current = Some(self);
        while let Some(node) = current {
            let taggers = node.taggers.borrow().clone();
            for tagger in taggers.iter().rev() {
                message = (tagger.get())(message)?;
            }
            current = node.parent.as_deref();
        }
        Some(message)
    }
}

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

/// Why a tree could not be mounted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MountError {
    #[error("mount target {0:?} does not exist in the document")]
    Missing(NodeId),
    #[error("mount target {0:?} is not an element")]
    NotAnElement(NodeId),
}

/// Why an event could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("handler for `{event}` produced a value of an unexpected type")]
    HandlerTypeMismatch { event: String },
}

/// Summary of one `apply_patches` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub applied: usize,
    pub unbound: usize,
}

/// Result of delivering one host event.
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Messages in bubbling order.
    pub messages: Vec<Message>,
    pub stop_propagation: bool,
    pub prevent_default: bool,
}

// ---------------------------------------------------------------------------
// LiveTree
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Listener {
    handler: Handler,
    event_node: Rc<EventNode>,
}

/// A virtual tree mounted into a document.
#[derive(Debug)]
pub struct LiveTree<D> {
    doc: D,
    container: NodeId,
    root: NodeId,
    root_events: Rc<EventNode>,
    event_refs: AHashMap<NodeId, Rc<EventNode>>,
    listeners: AHashMap<NodeId, AHashMap<String, Listener>>,
}

impl<D: Document> LiveTree<D> {
    /// Render `tree` and append it to `container`.
    pub fn mount(doc: D, container: NodeId, tree: &Node) -> Result<Self, MountError> {
        if !doc.contains(container) {
            return Err(MountError::Missing(container));
        }
        if !doc.is_element(container) {
            return Err(MountError::NotAnElement(container));
        }
        let root_events = EventNode::root();
        let mut live = Self {
            doc,
            container,
            root: container,
            root_events: Rc::clone(&root_events),
            event_refs: AHashMap::new(),
            listeners: AHashMap::new(),
        };
        let root = live.render(tree, &root_events);
        live.doc.insert_before(container, root, None);
        live.root = root;
        Ok(live)
    }

    pub fn document(&self) -> &D {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.doc
    }

    pub fn container(&self) -> NodeId {
        self.container
    }

    /// The host node standing for the current virtual root.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Build host nodes for `node`. The result is detached.
    pub fn render(&mut self, node: &Node, event_node: &Rc<EventNode>) -> NodeId {
        match node {
            Node::Thunk(thunk) => {
                let inner = thunk.force();
                self.render(&inner, event_node)
            }
            Node::Tagger(tagger) => {
                let (taggers, inner) = gather_taggers(tagger);
                let sub = EventNode::child(taggers, Rc::clone(event_node));
                let id = self.render(inner, &sub);
                self.event_refs.insert(id, sub);
                id
            }
            Node::Text(text) => self.doc.create_text(text),
            Node::Custom(custom) => {
                let id = (custom.render.get())(&*custom.model, &mut self.doc);
                self.apply_facts(id, event_node, &custom.facts);
                id
            }
            Node::Element(element) => {
                let id = self
                    .doc
                    .create_element(&element.tag, element.namespace.as_deref());
                self.apply_facts(id, event_node, &element.facts);
                for child in &element.children {
                    let kid = self.render(child, event_node);
                    self.doc.insert_before(id, kid, None);
                }
                id
            }
            Node::Keyed(keyed) => {
                let id = self
                    .doc
                    .create_element(&keyed.tag, keyed.namespace.as_deref());
                self.apply_facts(id, event_node, &keyed.facts);
                for (_, child) in &keyed.children {
                    let kid = self.render(child, event_node);
                    self.doc.insert_before(id, kid, None);
                }
                id
            }
        }
    }

    /// Apply `patches`, computed against `old`, to the live tree. Returns
    /// what was applied; the root may have been replaced.
    pub fn apply_patches(&mut self, old: &Node, patches: &mut [Patch]) -> PatchReport {
        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!("vdom_apply", patches = patches.len()).entered();

        let mut report = PatchReport::default();
        if patches.is_empty() {
            return report;
        }
        let root_events = Rc::clone(&self.root_events);
        self.locate(self.root, old, patches, &root_events);
        self.root = self.apply_list(self.root, patches, &mut report);
        report
    }

    /// Diff `old` against `new` and apply the result.
    pub fn patch(&mut self, old: &Node, new: &Node) -> PatchReport {
        let mut patches = crate::diff::diff(old, new);
        self.apply_patches(old, &mut patches)
    }

    /// Deliver an event of type `event` at `target`.
    pub fn dispatch(
        &self,
        target: NodeId,
        event: &str,
        payload: &Value,
    ) -> Result<Dispatched, DispatchError> {
        let mut out = Dispatched::default();
        let mut current = Some(target);
        while let Some(node) = current {
            if node == self.container {
                break;
            }
            if let Some(listener) = self.listeners.get(&node).and_then(|m| m.get(event)) {
                match listener.handler.handle(payload) {
                    Ok(Some(outcome)) => {
                        let mismatch = || DispatchError::HandlerTypeMismatch {
                            event: event.to_owned(),
                        };
                        let message = listener
                            .event_node
                            .deliver(outcome.message)
                            .ok_or_else(mismatch)?;
                        out.messages.push(message);
                        out.prevent_default |= outcome.prevent_default;
                        if outcome.stop_propagation {
                            out.stop_propagation = true;
                            break;
                        }
                    }
                    Ok(None) => {
                        return Err(DispatchError::HandlerTypeMismatch {
                            event: event.to_owned(),
                        });
                    }
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(event, error = %_err, "event decoder rejected payload");
                    }
                }
            }
            current = self.doc.parent(node);
        }
        Ok(out)
    }

    /// Whether `node` currently has a handler for `event`.
    pub fn has_handler(&self, node: NodeId, event: &str) -> bool {
        self.listeners
            .get(&node)
            .is_some_and(|m| m.contains_key(event))
    }

    // -----------------------------------------------------------------------
    // Locate pass
    // -----------------------------------------------------------------------

    fn locate(&self, dom: NodeId, vnode: &Node, patches: &mut [Patch], events: &Rc<EventNode>) {
        self.locate_help(dom, vnode, patches, 0, 0, vnode.descendants(), events);
    }

    #[allow(clippy::too_many_arguments)]
    fn locate_help(
        &self,
        dom: NodeId,
        vnode: &Node,
        patches: &mut [Patch],
        mut i: usize,
        low: usize,
        high: usize,
        events: &Rc<EventNode>,
    ) -> usize {
        let Some(mut index) = patches.get(i).map(|p| p.index) else {
            return i;
        };

        while index == low {
            let patch = &mut patches[i];
            patch.target = Some(dom);
            patch.event_node = Some(Rc::clone(events));
            match &mut patch.kind {
                PatchKind::Thunk(sub) => {
                    if let Node::Thunk(thunk) = vnode {
                        let inner = thunk.force();
                        self.locate(dom, &inner, sub, events);
                    }
                }
                PatchKind::Reorder(reorder) => {
                    if !reorder.patches.is_empty() {
                        self.locate_help(dom, vnode, &mut reorder.patches, 0, low, high, events);
                    }
                }
                PatchKind::Remove(Some(mv)) => {
                    if !mv.patches.is_empty() {
                        self.locate_help(dom, vnode, &mut mv.patches, 0, low, high, events);
                    }
                }
                _ => {}
            }
            i += 1;
            match patches.get(i) {
                Some(next) if next.index <= high => index = next.index,
                _ => return i,
            }
        }

        match vnode {
            Node::Tagger(tagger) => {
                let (_, inner) = gather_taggers(tagger);
                let sub = self
                    .event_refs
                    .get(&dom)
                    .cloned()
                    .unwrap_or_else(|| Rc::clone(events));
                self.locate_help(dom, inner, patches, i, low + 1, high, &sub)
            }
            Node::Element(element) => {
                self.locate_kids(dom, element.children.iter(), patches, i, low, high, events)
            }
            Node::Keyed(keyed) => self.locate_kids(
                dom,
                keyed.children.iter().map(|(_, n)| n),
                patches,
                i,
                low,
                high,
                events,
            ),
            Node::Text(_) | Node::Custom(_) | Node::Thunk(_) => i,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn locate_kids<'a>(
        &self,
        dom: NodeId,
        kids: impl Iterator<Item = &'a Node>,
        patches: &mut [Patch],
        mut i: usize,
        mut low: usize,
        high: usize,
        events: &Rc<EventNode>,
    ) -> usize {
        let Some(mut index) = patches.get(i).map(|p| p.index) else {
            return i;
        };
        for (j, kid) in kids.enumerate() {
            low += 1;
            let next_low = low + kid.descendants();
            if low <= index && index <= next_low {
                let Some(child) = self.doc.child(dom, j) else {
                    return i;
                };
                i = self.locate_help(child, kid, patches, i, low, next_low, events);
                match patches.get(i) {
                    Some(next) if next.index <= high => index = next.index,
                    _ => return i,
                }
            }
            low = next_low;
        }
        i
    }

    // -----------------------------------------------------------------------
    // Apply pass
    // -----------------------------------------------------------------------

    fn apply_list(&mut self, root: NodeId, patches: &mut [Patch], report: &mut PatchReport) -> NodeId {
        let mut root = root;
        for patch in patches.iter_mut() {
            let Some(target) = patch.target else {
                report.unbound += 1;
                continue;
            };
            let replaced = self.apply_one(target, patch, report);
            report.applied += 1;
            if target == root {
                root = replaced;
            }
        }
        root
    }

    fn apply_one(&mut self, dom: NodeId, patch: &mut Patch, report: &mut PatchReport) -> NodeId {
        let events = patch
            .event_node
            .clone()
            .unwrap_or_else(|| Rc::clone(&self.root_events));
        match &mut patch.kind {
            PatchKind::Redraw(node) => self.redraw(dom, node, &events),
            PatchKind::Facts(diff) => {
                self.apply_facts_diff(dom, &events, diff);
                dom
            }
            PatchKind::Text(text) => {
                self.doc.set_text(dom, text);
                dom
            }
            PatchKind::Thunk(sub) => self.apply_list(dom, sub, report),
            PatchKind::Tagger(taggers) => {
                match self.event_refs.get(&dom) {
                    Some(existing) => *existing.taggers.borrow_mut() = taggers.clone(),
                    None => {
                        let sub = EventNode::child(taggers.clone(), events);
                        self.event_refs.insert(dom, sub);
                    }
                }
                dom
            }
            PatchKind::RemoveLast { from, count } => {
                for _ in 0..*count {
                    if let Some(child) = self.doc.child(dom, *from) {
                        self.doc.remove_child(dom, child);
                        self.release(child);
                    }
                }
                dom
            }
            PatchKind::Append { from, children } => {
                let the_end = self.doc.child(dom, *from);
                for kid in children.iter() {
                    let id = self.render(kid, &events);
                    self.doc.insert_before(dom, id, the_end);
                }
                dom
            }
            PatchKind::Remove(mv) => {
                if let Some(parent) = self.doc.parent(dom) {
                    self.doc.remove_child(parent, dom);
                }
                match mv {
                    Some(mv) => self.apply_list(dom, &mut mv.patches, report),
                    None => {
                        self.release(dom);
                        dom
                    }
                }
            }
            PatchKind::Reorder(reorder) => {
                self.apply_reorder(dom, reorder, &events, report);
                dom
            }
            PatchKind::Custom(update) => (**update)(&mut self.doc, dom),
        }
    }

    fn redraw(&mut self, dom: NodeId, node: &Node, events: &Rc<EventNode>) -> NodeId {
        let parent = self.doc.parent(dom);
        let fresh = self.render(node, events);
        if !self.event_refs.contains_key(&fresh)
            && let Some(existing) = self.event_refs.get(&dom).cloned()
        {
            self.event_refs.insert(fresh, existing);
        }
        if let Some(parent) = parent {
            self.doc.replace_child(parent, fresh, dom);
        }
        self.release(dom);
        fresh
    }

    fn apply_reorder(
        &mut self,
        dom: NodeId,
        reorder: &mut Reorder,
        events: &Rc<EventNode>,
        report: &mut PatchReport,
    ) {
        let Reorder {
            patches,
            inserts,
            end_inserts,
            entries,
        } = reorder;

        for patch in patches.iter_mut() {
            let Some(target) = patch.target else {
                report.unbound += 1;
                continue;
            };
            let moved_entry = match &patch.kind {
                PatchKind::Remove(Some(mv)) => Some(mv.entry),
                _ => None,
            };
            let result = self.apply_one(target, patch, report);
            report.applied += 1;
            if let Some(entry) = moved_entry.and_then(|e| entries.get_mut(e)) {
                entry.live = Some(result);
            }
        }

        let ordered = inserts
            .iter()
            .map(|ins| (ins, ins.index))
            .chain(end_inserts.iter().flatten().map(|ins| (ins, None)));
        for (insert, position) in ordered {
            let Some(entry) = entries.get(insert.entry) else {
                continue;
            };
            let node = match (entry.kind, entry.live) {
                (EntryKind::Move, Some(live)) => live,
                _ => self.render(&entry.node, events),
            };
            let reference = position.and_then(|p| self.doc.child(dom, p));
            self.doc.insert_before(dom, node, reference);
        }
    }

    // -----------------------------------------------------------------------
    // Facts and listeners
    // -----------------------------------------------------------------------

    fn apply_facts(&mut self, dom: NodeId, events: &Rc<EventNode>, facts: &Facts) {
        if facts.is_empty() {
            return;
        }
        let diff = FactsDiff {
            properties: facts
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
            attributes: facts
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
            namespaced: facts
                .namespaced
                .iter()
                .map(|(k, (ns, v))| (k.clone(), ns.clone(), Some(v.clone())))
                .collect(),
            styles: facts
                .styles
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
            events: facts
                .events
                .iter()
                .map(|(k, h)| (k.clone(), Some(h.clone())))
                .collect(),
        };
        self.apply_facts_diff(dom, events, &diff);
    }

    fn apply_facts_diff(&mut self, dom: NodeId, events: &Rc<EventNode>, diff: &FactsDiff) {
        for (key, value) in &diff.styles {
            match value {
                Some(v) => self.doc.set_style(dom, key, v),
                None => self.doc.remove_style(dom, key),
            }
        }
        for (key, value) in &diff.attributes {
            match value {
                Some(v) => self.doc.set_attribute(dom, key, v),
                None => self.doc.remove_attribute(dom, key),
            }
        }
        for (key, namespace, value) in &diff.namespaced {
            match value {
                Some(v) => self.doc.set_attribute_ns(dom, namespace, key, v),
                None => self.doc.remove_attribute_ns(dom, namespace, key),
            }
        }
        for (key, value) in &diff.properties {
            match value {
                Some(v) => self.doc.set_property(dom, key, v),
                None => self.doc.remove_property(dom, key),
            }
        }
        for (event, handler) in &diff.events {
            self.apply_event(dom, events, event, handler.as_ref());
        }
    }

    fn apply_event(
        &mut self,
        dom: NodeId,
        events: &Rc<EventNode>,
        event: &str,
        handler: Option<&Handler>,
    ) {
        let slot = self.listeners.entry(dom).or_default();
        let Some(handler) = handler else {
            if slot.remove(event).is_some() {
                self.doc.remove_listener(dom, event);
            }
            return;
        };
        if let Some(existing) = slot.get_mut(event) {
            if existing.handler.kind == handler.kind {
                existing.handler = handler.clone();
                return;
            }
            slot.remove(event);
            self.doc.remove_listener(dom, event);
        }
        slot.insert(
            event.to_owned(),
            Listener {
                handler: handler.clone(),
                event_node: Rc::clone(events),
            },
        );
        self.doc.add_listener(
            dom,
            event,
            ListenerOptions {
                passive: handler.kind.passive(),
            },
        );
    }

    /// Forget listeners and event contexts for a discarded subtree.
    fn release(&mut self, dom: NodeId) {
        let mut stack = vec![dom];
        while let Some(node) = stack.pop() {
            self.listeners.remove(&node);
            self.event_refs.remove(&node);
            let count = self.doc.child_count(node);
            stack.extend((0..count).filter_map(|i| self.doc.child(node, i)));
        }
    }
}
