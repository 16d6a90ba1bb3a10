#![forbid(unsafe_code)]

//! Tree diffing.
//!
//! [`diff`] walks the old and new trees in lockstep and records what must
//! change, addressing every affected node by its pre-order index in the old
//! tree (see [`Node::descendants`]).
//!
//! # Algorithm
//!
//! - Pointer-equal subtrees are skipped outright.
//! - A variant, tag or namespace mismatch redraws the whole node. The one
//!   exception is an element turning keyed, which is compared as an element.
//! - Thunks with the same view and reference-identical arguments adopt the
//!   old subtree without building the new one.
//! - Positional children are paired by index, with a single trailing
//!   removal or append for the length difference.
//! - Keyed children are matched with a two-cursor walk that recognizes an
//!   adjacent swap, a single insertion, a single removal, or a replacement
//!   before giving up and treating the rest of both lists as removals and
//!   end insertions. A key that is removed in one place and inserted in
//!   another becomes a move, so its live node survives.
//!
//! # Invariants
//!
//! 1. `diff(t, t)` is empty for any tree `t`.
//! 2. Patches are emitted in ascending index order within each patch list.
//! 3. Unchanged facts are never emitted. When a node's facts change anyway,
//!    its `value` and `checked` properties ride along so user edits to the
//!    live node are overwritten.
//! 4. An adjacent keyed swap moves both nodes.

use ahash::AHashMap;

use crate::node::{Custom, Element, Facts, KeyedElement, Node, Tagger, Thunk, gather_taggers};
use crate::patch::{Entry, EntryKind, FactsDiff, Insert, Move, Patch, PatchKind, Reorder};

/// Suffix appended to a key that was already used in the same child list.
pub const DUPLICATE_KEY_SUFFIX: &str = "_vela_dup";

/// Compute the patches that turn `old` into `new`.
pub fn diff(old: &Node, new: &Node) -> Vec<Patch> {
    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("vdom_diff").entered();

    let mut patches = Vec::new();
    diff_help(old, new, &mut patches, 0);
    patches
}

fn diff_help(x: &Node, y: &Node, patches: &mut Vec<Patch>, index: usize) {
    if x.ptr_eq(y) {
        return;
    }
    match (x, y) {
        (Node::Text(a), Node::Text(b)) => {
            if a != b {
                patches.push(Patch::new(index, PatchKind::Text(b.to_string())));
            }
        }
        (Node::Element(a), Node::Element(b)) => diff_element(a, b, y, patches, index),
        (Node::Element(a), Node::Keyed(b)) => diff_element(a, &b.dekey(), y, patches, index),
        (Node::Keyed(a), Node::Keyed(b)) => diff_keyed_element(a, b, y, patches, index),
        (Node::Tagger(a), Node::Tagger(b)) => diff_tagger(a, b, y, patches, index),
        (Node::Thunk(a), Node::Thunk(b)) => diff_thunk(a, b, patches, index),
        (Node::Custom(a), Node::Custom(b)) => diff_custom(a, b, y, patches, index),
        _ => patches.push(Patch::new(index, PatchKind::Redraw(y.clone()))),
    }
}

fn diff_thunk(x: &Thunk, y: &Thunk, patches: &mut Vec<Patch>, index: usize) {
    if x.same_inputs(y) {
        if let Some(inner) = x.cached() {
            y.adopt(inner);
        }
        return;
    }
    let x_inner = x.force();
    let y_inner = y.force();
    let mut sub = Vec::new();
    diff_help(&x_inner, &y_inner, &mut sub, 0);
    if !sub.is_empty() {
        patches.push(Patch::new(index, PatchKind::Thunk(sub)));
    }
}

fn diff_tagger(x: &Tagger, y: &Tagger, redraw: &Node, patches: &mut Vec<Patch>, index: usize) {
    let (x_taggers, x_inner) = gather_taggers(x);
    let (y_taggers, y_inner) = gather_taggers(y);

    // Changing how many taggers are stacked changes the index layout below.
    if x_taggers.len() > 1 && x_taggers.len() != y_taggers.len() {
        patches.push(Patch::new(index, PatchKind::Redraw(redraw.clone())));
        return;
    }
    let same = x_taggers.len() == y_taggers.len()
        && x_taggers.iter().zip(&y_taggers).all(|(a, b)| a.same(b));
    if !same {
        patches.push(Patch::new(index, PatchKind::Tagger(y_taggers)));
    }
    diff_help(x_inner, y_inner, patches, index + 1);
}

fn diff_custom(x: &Custom, y: &Custom, redraw: &Node, patches: &mut Vec<Patch>, index: usize) {
    if !x.render.same(&y.render) {
        patches.push(Patch::new(index, PatchKind::Redraw(redraw.clone())));
        return;
    }
    if let Some(facts) = diff_facts(&x.facts, &y.facts) {
        patches.push(Patch::new(index, PatchKind::Facts(facts)));
    }
    if let Some(update) = (y.diff.get())(&*x.model, &*y.model) {
        patches.push(Patch::new(index, PatchKind::Custom(update)));
    }
}

/// Shared head of element diffing. Returns `false` when the node was
/// redrawn and its children must not be visited.
fn diff_head(
    x: (&str, Option<&str>, &Facts),
    y: (&str, Option<&str>, &Facts),
    redraw: &Node,
    patches: &mut Vec<Patch>,
    index: usize,
) -> bool {
    if x.0 != y.0 || x.1 != y.1 {
        patches.push(Patch::new(index, PatchKind::Redraw(redraw.clone())));
        return false;
    }
    if let Some(facts) = diff_facts(x.2, y.2) {
        patches.push(Patch::new(index, PatchKind::Facts(facts)));
    }
    true
}

fn diff_element(x: &Element, y: &Element, redraw: &Node, patches: &mut Vec<Patch>, index: usize) {
    let proceed = diff_head(
        (x.tag.as_str(), x.namespace.as_deref(), &x.facts),
        (y.tag.as_str(), y.namespace.as_deref(), &y.facts),
        redraw,
        patches,
        index,
    );
    if proceed {
        diff_kids(&x.children, &y.children, patches, index);
    }
}

fn diff_keyed_element(
    x: &KeyedElement,
    y: &KeyedElement,
    redraw: &Node,
    patches: &mut Vec<Patch>,
    index: usize,
) {
    let proceed = diff_head(
        (x.tag.as_str(), x.namespace.as_deref(), &x.facts),
        (y.tag.as_str(), y.namespace.as_deref(), &y.facts),
        redraw,
        patches,
        index,
    );
    if proceed {
        diff_keyed_kids(&x.children, &y.children, patches, index);
    }
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// Properties mirrored by user interaction rather than only by the view.
const LIVE_STATE: [&str; 2] = ["value", "checked"];

/// Fact changes from `x` to `y`, or `None` when nothing changed.
pub fn diff_facts(x: &Facts, y: &Facts) -> Option<FactsDiff> {
    let mut out = FactsDiff::default();
    diff_category(&x.properties, &y.properties, &mut out.properties);
    diff_category(&x.attributes, &y.attributes, &mut out.attributes);
    diff_category(&x.styles, &y.styles, &mut out.styles);
    diff_category(&x.events, &y.events, &mut out.events);

    for (key, (namespace, _)) in &x.namespaced {
        if !y.namespaced.contains_key(key) {
            out.namespaced.push((key.clone(), namespace.clone(), None));
        }
    }
    for (key, (namespace, value)) in &y.namespaced {
        if x.namespaced.get(key) != Some(&(namespace.clone(), value.clone())) {
            out.namespaced
                .push((key.clone(), namespace.clone(), Some(value.clone())));
        }
    }

    if out.is_empty() {
        return None;
    }
    for key in LIVE_STATE {
        if let Some(value) = y.properties.get(key)
            && !out.properties.iter().any(|(k, _)| k == key)
        {
            out.properties.push((key.to_owned(), Some(value.clone())));
        }
    }
    Some(out)
}

fn diff_category<V: Clone + PartialEq>(
    x: &std::collections::BTreeMap<String, V>,
    y: &std::collections::BTreeMap<String, V>,
    out: &mut Vec<(String, Option<V>)>,
) {
    for key in x.keys() {
        if !y.contains_key(key) {
            out.push((key.clone(), None));
        }
    }
    for (key, new) in y {
        if x.get(key) != Some(new) {
            out.push((key.clone(), Some(new.clone())));
        }
    }
}

// ---------------------------------------------------------------------------
// Positional children
// ---------------------------------------------------------------------------

fn diff_kids(x_kids: &[Node], y_kids: &[Node], patches: &mut Vec<Patch>, root_index: usize) {
    let (x_len, y_len) = (x_kids.len(), y_kids.len());
    if x_len > y_len {
        patches.push(Patch::new(
            root_index,
            PatchKind::RemoveLast {
                from: y_len,
                count: x_len - y_len,
            },
        ));
    } else if x_len < y_len {
        patches.push(Patch::new(
            root_index,
            PatchKind::Append {
                from: x_len,
                children: y_kids[x_len..].to_vec(),
            },
        ));
    }

    let mut index = root_index;
    for (x_kid, y_kid) in x_kids.iter().zip(y_kids) {
        index += 1;
        diff_help(x_kid, y_kid, patches, index);
        index += x_kid.descendants();
    }
}

// ---------------------------------------------------------------------------
// Keyed children
// ---------------------------------------------------------------------------

#[derive(Default)]
struct KeyedDiff {
    patches: Vec<Patch>,
    inserts: Vec<Insert>,
    end_inserts: Option<Vec<Insert>>,
    entries: Vec<Entry>,
    changes: AHashMap<String, usize>,
}

impl KeyedDiff {
    fn push_insert(&mut self, insert: Insert, at_end: bool) {
        if at_end {
            self.end_inserts.get_or_insert_with(Vec::new).push(insert);
        } else {
            self.inserts.push(insert);
        }
    }

    fn insert_node(&mut self, key: &str, node: &Node, y_index: Option<usize>, at_end: bool) {
        let mut key = key.to_owned();
        loop {
            let Some(&id) = self.changes.get(&key) else {
                let id = self.entries.len();
                self.entries.push(Entry {
                    key: key.clone(),
                    kind: EntryKind::Insert,
                    node: node.clone(),
                    index: y_index,
                    removal: None,
                    live: None,
                });
                self.changes.insert(key, id);
                self.push_insert(Insert { index: y_index, entry: id }, at_end);
                return;
            };

            if self.entries[id].kind != EntryKind::Remove {
                key.push_str(DUPLICATE_KEY_SUFFIX);
                continue;
            }

            // Removed earlier in the walk: the node moves here.
            self.push_insert(Insert { index: y_index, entry: id }, at_end);
            let old = self.entries[id].node.clone();
            let old_index = self.entries[id].index.unwrap_or(0);
            let mut sub = Vec::new();
            diff_help(&old, node, &mut sub, old_index);

            let entry = &mut self.entries[id];
            entry.kind = EntryKind::Move;
            entry.node = node.clone();
            entry.index = y_index;
            if let Some(removal) = entry.removal
                && let Some(patch) = self.patches.get_mut(removal)
            {
                patch.kind = PatchKind::Remove(Some(Move {
                    patches: sub,
                    entry: id,
                }));
            }
            return;
        }
    }

    fn remove_node(&mut self, key: &str, node: &Node, index: usize) {
        let mut key = key.to_owned();
        loop {
            let Some(&id) = self.changes.get(&key) else {
                let removal = self.patches.len();
                self.patches
                    .push(Patch::new(index, PatchKind::Remove(None)));
                let id = self.entries.len();
                self.entries.push(Entry {
                    key: key.clone(),
                    kind: EntryKind::Remove,
                    node: node.clone(),
                    index: Some(index),
                    removal: Some(removal),
                    live: None,
                });
                self.changes.insert(key, id);
                return;
            };

            if self.entries[id].kind != EntryKind::Insert {
                key.push_str(DUPLICATE_KEY_SUFFIX);
                continue;
            }

            // Inserted earlier in the walk: the node moves there.
            self.entries[id].kind = EntryKind::Move;
            let new = self.entries[id].node.clone();
            let mut sub = Vec::new();
            diff_help(node, &new, &mut sub, index);
            self.patches.push(Patch::new(
                index,
                PatchKind::Remove(Some(Move {
                    patches: sub,
                    entry: id,
                })),
            ));
            return;
        }
    }
}

fn diff_keyed_kids(
    xs: &[(String, Node)],
    ys: &[(String, Node)],
    patches: &mut Vec<Patch>,
    root_index: usize,
) {
    let mut state = KeyedDiff::default();
    let (x_len, y_len) = (xs.len(), ys.len());
    let mut x_index = 0;
    let mut y_index = 0;
    let mut index = root_index;

    while x_index < x_len && y_index < y_len {
        let (x_key, x_node) = &xs[x_index];
        let (y_key, y_node) = &ys[y_index];

        if x_key == y_key {
            index += 1;
            diff_help(x_node, y_node, &mut state.patches, index);
            index += x_node.descendants();
            x_index += 1;
            y_index += 1;
            continue;
        }

        let x_next = xs.get(x_index + 1);
        let y_next = ys.get(y_index + 1);
        let new_match = y_next.is_some_and(|(k, _)| k == x_key);
        let old_match = x_next.is_some_and(|(k, _)| k == y_key);

        match (x_next, y_next) {
            // Swap: x and y traded places. Both nodes move.
            (Some((_, x_next_node)), Some((_, y_next_node))) if new_match && old_match => {
                index += 1;
                state.remove_node(x_key, x_node, index);
                state.insert_node(y_key, y_node, Some(y_index), false);
                index += x_node.descendants();
                index += 1;
                state.remove_node(y_key, x_next_node, index);
                state.insert_node(x_key, y_next_node, Some(y_index + 1), false);
                index += x_next_node.descendants();
                x_index += 2;
                y_index += 2;
            }
            // Insert y in front of x.
            (_, Some((_, y_next_node))) if new_match => {
                index += 1;
                state.insert_node(y_key, y_node, Some(y_index), false);
                diff_help(x_node, y_next_node, &mut state.patches, index);
                index += x_node.descendants();
                x_index += 1;
                y_index += 2;
            }
            // Remove x.
            (Some((_, x_next_node)), _) if old_match => {
                index += 1;
                state.remove_node(x_key, x_node, index);
                index += x_node.descendants();
                index += 1;
                diff_help(x_next_node, y_node, &mut state.patches, index);
                index += x_next_node.descendants();
                x_index += 2;
                y_index += 1;
            }
            // Replace x with y.
            (Some((x_next_key, x_next_node)), Some((y_next_key, y_next_node)))
                if x_next_key == y_next_key =>
            {
                index += 1;
                state.remove_node(x_key, x_node, index);
                state.insert_node(y_key, y_node, Some(y_index), false);
                index += x_node.descendants();
                index += 1;
                diff_help(x_next_node, y_next_node, &mut state.patches, index);
                index += x_next_node.descendants();
                x_index += 2;
                y_index += 2;
            }
            _ => break,
        }
    }

    for (x_key, x_node) in &xs[x_index..] {
        index += 1;
        state.remove_node(x_key, x_node, index);
        index += x_node.descendants();
    }

    for (y_key, y_node) in &ys[y_index..] {
        state.insert_node(y_key, y_node, None, true);
    }

    let reorder = Reorder {
        patches: state.patches,
        inserts: state.inserts,
        end_inserts: state.end_inserts,
        entries: state.entries,
    };
    if !reorder.is_noop() {
        patches.push(Patch::new(root_index, PatchKind::Reorder(reorder)));
    }
}
