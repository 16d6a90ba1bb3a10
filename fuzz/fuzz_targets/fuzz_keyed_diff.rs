#![no_main]

//! Two arbitrary keyed lists, duplicates included. Patching the first into
//! the second must produce the same document as rendering the second from
//! scratch.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use vela_vdom::{Fact, LiveTree, MemoryDocument, Node, diff};

#[derive(Debug, Arbitrary)]
struct Input {
    old: Vec<(u8, bool)>,
    new: Vec<(u8, bool)>,
}

fn list(items: &[(u8, bool)]) -> Node {
    Node::keyed(
        "ul",
        vec![],
        items
            .iter()
            .take(32)
            .map(|&(key, marked)| {
                let key = (key % 16).to_string();
                let facts = if marked {
                    vec![Fact::Attribute("class".into(), "marked".into())]
                } else {
                    vec![]
                };
                (key.clone(), Node::element("li", facts, vec![Node::text(&key)]))
            })
            .collect(),
    )
}

fn mount(tree: &Node) -> Option<LiveTree<MemoryDocument>> {
    let mut doc = MemoryDocument::new();
    let container = doc.create_root("body");
    LiveTree::mount(doc, container, tree).ok()
}

fuzz_target!(|input: Input| {
    let old = list(&input.old);
    let new = list(&input.new);
    let (Some(mut live), Some(fresh)) = (mount(&old), mount(&new)) else {
        return;
    };
    let mut patches = diff(&old, &new);
    let report = live.apply_patches(&old, &mut patches);
    assert_eq!(report.unbound, 0);
    assert_eq!(
        live.document().snapshot(live.root()),
        fresh.document().snapshot(fresh.root())
    );
});
