//! Reconciliation properties: patching an old live tree must land exactly
//! where rendering the new tree from scratch would.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use proptest::prelude::*;
use serde_json::Value;
use vela_json::func;
use vela_vdom::node::{CustomDiffFn, CustomRenderFn, TaggerFn, ThunkFn};
use vela_vdom::patch::{CustomPatch, PatchKind};
use vela_vdom::{Document, Fact, LiveTree, Message, MemoryDocument, Node, NodeId, diff, html};

fn mount(tree: &Node) -> LiveTree<MemoryDocument> {
    let mut doc = MemoryDocument::new();
    let container = doc.create_root("body");
    LiveTree::mount(doc, container, tree).expect("container is an element")
}

fn patched(old: &Node, new: &Node) -> LiveTree<MemoryDocument> {
    let mut live = mount(old);
    let mut patches = diff(old, new);
    let report = live.apply_patches(old, &mut patches);
    assert_eq!(report.unbound, 0, "every patch binds to a live node");
    live
}

fn markup(live: &LiveTree<MemoryDocument>) -> String {
    live.document().markup(live.root())
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

fn arb_facts() -> impl Strategy<Value = Vec<Fact>> {
    let attr = (prop::sample::select(vec!["id", "title", "class"]), "[xyz]")
        .prop_map(|(k, v)| Fact::Attribute(k.to_owned(), v));
    let style = (prop::sample::select(vec!["color", "margin"]), "[12]")
        .prop_map(|(k, v)| Fact::Style(k.to_owned(), v));
    let prop = (prop::sample::select(vec!["hidden", "tabIndex"]), any::<bool>())
        .prop_map(|(k, v)| Fact::Property(k.to_owned(), Value::Bool(v)));
    let value = "[xy]".prop_map(|v| Fact::Property("value".into(), Value::String(v)));
    let checked = any::<bool>().prop_map(|v| Fact::Property("checked".into(), Value::Bool(v)));
    prop::collection::vec(prop_oneof![attr, style, prop, value, checked], 0..4)
}

fn tagger_fn(alt: bool) -> TaggerFn {
    if alt {
        func!(dyn Fn(Message) -> Option<Message>, |m: Message| Some(m))
    } else {
        func!(dyn Fn(Message) -> Option<Message>, |m: Message| Some(m))
    }
}

thread_local! {
    // Shared so that independently generated thunks can have identical inputs.
    static THUNK_ARGS: Vec<Rc<dyn Any>> =
        (0..3_i64).map(|n| Rc::new(n) as Rc<dyn Any>).collect();
}

fn thunk_arg(n: usize) -> Rc<dyn Any> {
    THUNK_ARGS.with(|args| Rc::clone(&args[n]))
}

fn thunk_view(alt: bool) -> vela_json::Func<ThunkFn> {
    if alt {
        func!(ThunkFn, |args: &[Rc<dyn Any>]| {
            let n = args.first()?.downcast_ref::<i64>()?;
            Some(Node::element("b", vec![], vec![Node::text(n.to_string())]))
        })
    } else {
        func!(ThunkFn, |args: &[Rc<dyn Any>]| {
            let n = args.first()?.downcast_ref::<i64>()?;
            Some(Node::element("span", vec![], vec![Node::text(n.to_string())]))
        })
    }
}

fn arb_node() -> impl Strategy<Value = Node> {
    let leaf = prop_oneof![
        3 => "[ab]{0,2}".prop_map(Node::text),
        1 => (any::<bool>(), 0_usize..3)
            .prop_map(|(alt, n)| Node::thunk(thunk_view(alt), vec![thunk_arg(n)])),
        1 => (0_u32..3, arb_facts()).prop_map(|(width, facts)| {
            Node::custom(facts, Rc::new(width), canvas_render(), canvas_diff())
        }),
    ];
    leaf.prop_recursive(4, 48, 5, |inner| {
        prop_oneof![
            (
                prop::sample::select(vec!["div", "span"]),
                arb_facts(),
                prop::collection::vec(inner.clone(), 0..5),
            )
                .prop_map(|(tag, facts, kids)| Node::element(tag, facts, kids)),
            // Keys repeat on purpose.
            (
                prop::sample::select(vec!["div", "ul"]),
                arb_facts(),
                prop::collection::vec((0_u8..6, inner.clone()), 0..6),
            )
                .prop_map(|(tag, facts, kids)| {
                    let kids = kids.into_iter().map(|(k, n)| (format!("k{k}"), n)).collect();
                    Node::keyed(tag, facts, kids)
                }),
            (any::<bool>(), inner).prop_map(|(alt, n)| Node::tagger(tagger_fn(alt), n)),
        ]
    })
}

/// Rebuild a tree from scratch so no allocation is shared.
fn deep_copy(node: &Node) -> Node {
    match node {
        Node::Text(t) => Node::text(&**t),
        Node::Element(e) => Node::element_ns(
            e.namespace.clone(),
            e.tag.clone(),
            facts_of(&e.facts),
            e.children.iter().map(deep_copy).collect(),
        ),
        Node::Keyed(k) => Node::keyed_ns(
            k.namespace.clone(),
            k.tag.clone(),
            facts_of(&k.facts),
            k.children
                .iter()
                .map(|(key, n)| (key.clone(), deep_copy(n)))
                .collect(),
        ),
        Node::Tagger(t) => Node::tagger(t.map.clone(), deep_copy(&t.inner)),
        Node::Custom(c) => Node::custom(
            facts_of(&c.facts),
            Rc::clone(&c.model),
            c.render.clone(),
            c.diff.clone(),
        ),
        Node::Thunk(_) => node.clone(),
    }
}

fn facts_of(facts: &vela_vdom::Facts) -> Vec<Fact> {
    let mut out = Vec::new();
    out.extend(facts.attributes.iter().map(|(k, v)| Fact::Attribute(k.clone(), v.clone())));
    out.extend(facts.styles.iter().map(|(k, v)| Fact::Style(k.clone(), v.clone())));
    out.extend(facts.properties.iter().map(|(k, v)| Fact::Property(k.clone(), v.clone())));
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn patching_matches_fresh_render(a in arb_node(), b in arb_node()) {
        let live = patched(&a, &b);
        let fresh = mount(&b);
        prop_assert_eq!(
            live.document().snapshot(live.root()),
            fresh.document().snapshot(fresh.root())
        );
        prop_assert_eq!(live.document().child_count(live.container()), 1);
    }

    #[test]
    fn patching_is_stable_when_applied_twice_in_a_row(a in arb_node(), b in arb_node(), c in arb_node()) {
        let mut live = patched(&a, &b);
        let mut patches = diff(&b, &c);
        let report = live.apply_patches(&b, &mut patches);
        prop_assert_eq!(report.unbound, 0);
        let fresh = mount(&c);
        prop_assert_eq!(
            live.document().snapshot(live.root()),
            fresh.document().snapshot(fresh.root())
        );
    }

    #[test]
    fn identical_structure_needs_no_patches(a in arb_node()) {
        prop_assert!(diff(&a, &a).is_empty());
        prop_assert!(diff(&a, &deep_copy(&a)).is_empty());
    }
}

// ---------------------------------------------------------------------------
// Keyed children
// ---------------------------------------------------------------------------

fn list(keys: &[&str]) -> Node {
    Node::keyed(
        "ul",
        vec![],
        keys.iter()
            .map(|k| {
                (
                    (*k).to_owned(),
                    Node::element("li", vec![Fact::Attribute("id".into(), (*k).to_owned())], vec![Node::text(k)]),
                )
            })
            .collect(),
    )
}

fn li_ids(live: &LiveTree<MemoryDocument>) -> Vec<(String, NodeId)> {
    let doc = live.document();
    doc.children(live.root())
        .iter()
        .map(|&id| (doc.text_content(id), id))
        .collect()
}

#[test]
fn keyed_reorders_keep_host_nodes() {
    let cases: &[(&[&str], &[&str])] = &[
        (&["a", "b"], &["b", "a"]),
        (&["a", "b", "c", "d"], &["d", "a", "b", "c"]),
        (&["a", "b", "c", "d"], &["b", "c", "d", "a"]),
        (&["a", "b", "c"], &["c", "b", "a"]),
        (&["a", "b", "c", "d", "e"], &["e", "d", "c", "b", "a"]),
    ];
    for (from, to) in cases {
        let old = list(from);
        let new = list(to);
        let mut live = mount(&old);
        let original: HashMap<_, _> = li_ids(&live).into_iter().collect();
        let mut patches = diff(&old, &new);
        let moved: Vec<String> = match &patches[..] {
            [p] => match &p.kind {
                PatchKind::Reorder(r) => r.moved_keys().map(str::to_owned).collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        assert!(!moved.is_empty(), "{from:?} -> {to:?} moves something");
        live.apply_patches(&old, &mut patches);

        let after = li_ids(&live);
        let order: Vec<_> = after.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(&order, to, "order after {from:?} -> {to:?}");
        for (key, id) in &after {
            if moved.contains(key) {
                assert_eq!(original.get(key), Some(id), "{key} kept its host node");
            }
        }
    }
}

#[test]
fn keyed_swap_is_one_reorder_of_both_keys() {
    let old = list(&["a", "b", "c"]);
    let new = list(&["b", "a", "c"]);
    let patches = diff(&old, &new);
    assert_eq!(patches.len(), 1);
    let PatchKind::Reorder(r) = &patches[0].kind else {
        panic!("expected reorder, got {patches:?}");
    };
    assert_eq!(r.moved_keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(r.inserted_keys().collect::<Vec<_>>(), vec!["b", "a"]);

    let mut live = mount(&old);
    live.document_mut().reset_stats();
    let before: HashMap<_, _> = li_ids(&live).into_iter().collect();
    let mut patches = patches;
    let report = live.apply_patches(&old, &mut patches);
    assert_eq!(report.unbound, 0);
    assert_eq!(live.document().stats().created, 0);
    let after = li_ids(&live);
    let order: Vec<_> = after.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(order, ["b", "a", "c"]);
    for (key, id) in &after {
        assert_eq!(before.get(key), Some(id), "{key} kept its host node");
    }
}

#[test]
fn keyed_append_creates_one_node() {
    let old = list(&["a", "b"]);
    let new = list(&["a", "b", "c"]);
    let mut live = mount(&old);
    live.document_mut().reset_stats();
    let mut patches = diff(&old, &new);
    live.apply_patches(&old, &mut patches);
    // One <li>, one text node.
    assert_eq!(live.document().stats().created, 2);
    assert_eq!(markup(&live), "<ul><li id=\"a\">a</li><li id=\"b\">b</li><li id=\"c\">c</li></ul>");
}

#[test]
fn duplicate_keys_still_reconcile() {
    let old = list(&["a", "x"]);
    let new = list(&["x", "a", "x", "x"]);
    let live = patched(&old, &new);
    let fresh = mount(&new);
    assert_eq!(markup(&live), markup(&fresh));
}

// ---------------------------------------------------------------------------
// Thunks, taggers, custom nodes
// ---------------------------------------------------------------------------

thread_local! {
    static VIEW_CALLS: Cell<usize> = const { Cell::new(0) };
}

fn counted_view(n: &i64) -> html::Html<()> {
    VIEW_CALLS.with(|c| c.set(c.get() + 1));
    html::span(vec![], vec![html::text(n.to_string())])
}

#[test]
fn lazy_view_runs_only_when_inputs_change() {
    VIEW_CALLS.with(|c| c.set(0));
    let arg = Rc::new(1_i64);
    let first = html::div(vec![], vec![html::lazy(counted_view, Rc::clone(&arg))]).into_node();
    let mut live = mount(&first);
    assert_eq!(VIEW_CALLS.with(Cell::get), 1);

    let second = html::div(vec![], vec![html::lazy(counted_view, Rc::clone(&arg))]).into_node();
    let mut patches = diff(&first, &second);
    assert!(patches.is_empty());
    live.apply_patches(&first, &mut patches);
    assert_eq!(VIEW_CALLS.with(Cell::get), 1);

    let third = html::div(vec![], vec![html::lazy(counted_view, Rc::new(2_i64))]).into_node();
    let mut patches = diff(&second, &third);
    live.apply_patches(&second, &mut patches);
    assert_eq!(VIEW_CALLS.with(Cell::get), 2);
    assert_eq!(markup(&live), "<div><span>2</span></div>");
}

#[test]
fn root_redraw_replaces_container_child() {
    let old = Node::element("div", vec![], vec![]);
    let new = Node::element("section", vec![], vec![Node::text("x")]);
    let live = patched(&old, &new);
    assert_eq!(markup(&live), "<section>x</section>");
    let doc = live.document();
    assert_eq!(doc.children(live.container()), &[live.root()]);
}

#[test]
fn mount_rejects_text_container() {
    let mut doc = MemoryDocument::new();
    let text = doc.create_text("nope");
    let err = LiveTree::mount(doc, text, &Node::text("x")).unwrap_err();
    assert_eq!(err, vela_vdom::MountError::NotAnElement(text));
}

fn canvas_render() -> vela_json::Func<CustomRenderFn> {
    func!(CustomRenderFn, |model: &dyn Any, doc: &mut dyn Document| {
        let id = doc.create_element("canvas", None);
        if let Some(w) = model.downcast_ref::<u32>() {
            doc.set_attribute(id, "width", &w.to_string());
        }
        id
    })
}

fn canvas_diff() -> vela_json::Func<CustomDiffFn> {
    func!(CustomDiffFn, |old: &dyn Any, new: &dyn Any| {
        let (old, new) = (old.downcast_ref::<u32>()?, *new.downcast_ref::<u32>()?);
        (*old != new).then(|| {
            let patch: CustomPatch = Rc::new(move |doc: &mut dyn Document, node: NodeId| {
                doc.set_attribute(node, "width", &new.to_string());
                node
            });
            patch
        })
    })
}

#[test]
fn custom_nodes_use_their_own_diff() {
    let old = Node::custom(vec![], Rc::new(10_u32), canvas_render(), canvas_diff());
    let new = Node::custom(vec![], Rc::new(20_u32), canvas_render(), canvas_diff());
    let mut live = mount(&old);
    let root_before = live.root();
    let mut patches = diff(&old, &new);
    assert!(matches!(patches[0].kind, PatchKind::Custom(_)));
    live.apply_patches(&old, &mut patches);
    assert_eq!(live.root(), root_before);
    assert_eq!(live.document().attribute(live.root(), "width"), Some("20"));
}
