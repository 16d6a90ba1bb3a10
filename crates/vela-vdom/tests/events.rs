//! Event dispatch through the live tree: bubbling, taggers, propagation
//! control, and handler updates.

use serde_json::json;
use vela_json::decode;
use vela_vdom::html::{self, Html};
use vela_vdom::{LiveTree, MemoryDocument, Message, Node, diff};

#[derive(Clone, Debug, PartialEq)]
enum Child {
    Pressed,
    Typed(String),
}

#[derive(Clone, Debug, PartialEq)]
enum Parent {
    FromChild(Child),
    Outer,
}

fn mount(tree: &Node) -> LiveTree<MemoryDocument> {
    let mut doc = MemoryDocument::new();
    let container = doc.create_root("body");
    LiveTree::mount(doc, container, tree).expect("container is an element")
}

fn take<T: 'static>(messages: Vec<Message>) -> Vec<T> {
    messages
        .into_iter()
        .map(|m| *m.downcast::<T>().expect("message type"))
        .collect()
}

#[test]
fn click_bubbles_to_ancestors() {
    let view: Html<Parent> = html::div(
        vec![html::on_click(Parent::Outer)],
        vec![html::button(
            vec![html::id("b"), html::on_click(Parent::FromChild(Child::Pressed))],
            vec![html::text("go")],
        )],
    );
    let live = mount(view.node());
    let button = live.document().find_id(live.root(), "b").expect("button");
    let out = live.dispatch(button, "click", &json!({})).expect("dispatch");
    assert_eq!(
        take::<Parent>(out.messages),
        vec![Parent::FromChild(Child::Pressed), Parent::Outer]
    );
    assert!(!out.stop_propagation);
}

#[test]
fn taggers_map_messages_outward() {
    let child: Html<Child> = html::button(
        vec![html::id("b"), html::on_click(Child::Pressed)],
        vec![],
    );
    let view: Html<Parent> = html::div(vec![], vec![child.map(Parent::FromChild)]);
    let live = mount(view.node());
    let button = live.document().find_id(live.root(), "b").expect("button");
    let out = live.dispatch(button, "click", &json!({})).expect("dispatch");
    assert_eq!(take::<Parent>(out.messages), vec![Parent::FromChild(Child::Pressed)]);
}

#[test]
fn input_stops_propagation() {
    let child: Html<Child> = html::input(
        vec![html::id("i"), html::on_input(Child::Typed)],
        vec![],
    );
    let view: Html<Parent> = html::div(
        vec![html::on("input", decode::succeed(Parent::Outer))],
        vec![child.map(Parent::FromChild)],
    );
    let live = mount(view.node());
    let input = live.document().find_id(live.root(), "i").expect("input");
    let out = live
        .dispatch(input, "input", &json!({"target": {"value": "hey"}}))
        .expect("dispatch");
    assert!(out.stop_propagation);
    assert_eq!(
        take::<Parent>(out.messages),
        vec![Parent::FromChild(Child::Typed("hey".into()))]
    );
}

#[test]
fn decoder_failure_skips_handler_and_keeps_bubbling() {
    let view: Html<Parent> = html::div(
        vec![html::on_click(Parent::Outer)],
        vec![html::span(
            vec![
                html::id("s"),
                html::on(
                    "click",
                    decode::field("detail", decode::int()).map(|_| Parent::FromChild(Child::Pressed)),
                ),
            ],
            vec![],
        )],
    );
    let live = mount(view.node());
    let span = live.document().find_id(live.root(), "s").expect("span");
    let out = live.dispatch(span, "click", &json!({})).expect("dispatch");
    assert_eq!(take::<Parent>(out.messages), vec![Parent::Outer]);
}

#[test]
fn submit_prevents_default() {
    let view: Html<Parent> = html::form(vec![html::on_submit(Parent::Outer)], vec![]);
    let live = mount(view.node());
    let out = live.dispatch(live.root(), "submit", &json!({})).expect("dispatch");
    assert!(out.prevent_default);
    let listener = live.document().listener(live.root(), "submit").expect("listener");
    assert!(!listener.passive);
}

#[test]
fn same_kind_handler_updates_without_reregistering() {
    let first: Html<Parent> = html::button(vec![html::on_click(Parent::Outer)], vec![]);
    let second: Html<Parent> =
        html::button(vec![html::on_click(Parent::FromChild(Child::Pressed))], vec![]);
    let mut live = mount(first.node());
    let before = live.document().stats();

    let mut patches = diff(first.node(), second.node());
    live.apply_patches(first.node(), &mut patches);
    let after = live.document().stats();
    assert_eq!(after.listeners_added, before.listeners_added);
    assert_eq!(after.listeners_removed, before.listeners_removed);

    let out = live.dispatch(live.root(), "click", &json!({})).expect("dispatch");
    assert_eq!(take::<Parent>(out.messages), vec![Parent::FromChild(Child::Pressed)]);
}

#[test]
fn kind_change_reregisters_listener() {
    let first: Html<Parent> = html::form(vec![html::on("submit", decode::succeed(Parent::Outer))], vec![]);
    let second: Html<Parent> = html::form(vec![html::on_submit(Parent::Outer)], vec![]);
    let mut live = mount(first.node());
    assert_eq!(live.document().listener(live.root(), "submit").map(|l| l.passive), Some(true));

    let mut patches = diff(first.node(), second.node());
    live.apply_patches(first.node(), &mut patches);
    assert_eq!(live.document().listener(live.root(), "submit").map(|l| l.passive), Some(false));
}

#[test]
fn removed_handler_stops_delivering() {
    let first: Html<Parent> = html::button(vec![html::on_click(Parent::Outer)], vec![]);
    let second: Html<Parent> = html::button(vec![], vec![]);
    let mut live = mount(first.node());
    let mut patches = diff(first.node(), second.node());
    live.apply_patches(first.node(), &mut patches);
    assert!(!live.has_handler(live.root(), "click"));
    let out = live.dispatch(live.root(), "click", &json!({})).expect("dispatch");
    assert!(out.messages.is_empty());
}

#[test]
fn tagger_swap_changes_mapping_in_place() {
    fn wrap_a(c: Child) -> Parent {
        Parent::FromChild(c)
    }
    fn wrap_b(_: Child) -> Parent {
        Parent::Outer
    }
    let child = || -> Html<Child> { html::button(vec![html::id("b"), html::on_click(Child::Pressed)], vec![]) };
    let first: Html<Parent> = html::div(vec![], vec![child().map(wrap_a)]);
    let second: Html<Parent> = html::div(vec![], vec![child().map(wrap_b)]);

    let mut live = mount(first.node());
    let button = live.document().find_id(live.root(), "b").expect("button");
    let mut patches = diff(first.node(), second.node());
    live.apply_patches(first.node(), &mut patches);

    assert_eq!(live.document().find_id(live.root(), "b"), Some(button));
    let out = live.dispatch(button, "click", &json!({})).expect("dispatch");
    assert_eq!(take::<Parent>(out.messages), vec![Parent::Outer]);
}
