#![forbid(unsafe_code)]

//! The virtual node model.
//!
//! A [`Node`] is an immutable description of a piece of UI. Every variant
//! that owns data is behind an `Rc`, so cloning a node is O(1) and reusing a
//! subtree between two views makes the diff skip it by pointer identity.
//!
//! # Variants
//!
//! | Variant   | Meaning                                                   |
//! |-----------|-----------------------------------------------------------|
//! | `Text`    | A text leaf                                               |
//! | `Element` | Tag, optional namespace, facts, ordered children          |
//! | `Keyed`   | Like `Element`, but each child carries a string key        |
//! | `Custom`  | Host-rendered leaf with its own render and diff functions  |
//! | `Tagger`  | Transforms messages produced by the wrapped subtree        |
//! | `Thunk`   | Lazily built subtree, memoized on its inputs               |
//!
//! # Invariants
//!
//! 1. `descendants` of an element is the sum over its children of
//!    `1 + child.descendants()`; a tagger counts `1 + inner`; text, custom
//!    and thunk nodes count 0. The diff and the patch locator both rely on
//!    this numbering.
//! 2. `Facts::organize` partitions facts by category; `class` and
//!    `className` values accumulate with a single space between them while
//!    every other duplicate keeps the last value.
//! 3. A thunk's cached subtree is built at most once per thunk value.
//!
//! # Failure Modes
//!
//! - A thunk whose view cannot read its own arguments (only reachable by
//!   building thunks by hand with mismatched argument types) renders as an
//!   empty text node.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use smallvec::{SmallVec, smallvec};
use vela_json::{Func, Output, RawDecoder};

use crate::document::{Document, NodeId};
use crate::patch::CustomPatch;

/// A type-erased application message.
pub type Message = Box<dyn Any>;

/// Message transformation installed by a tagger. Returns `None` when the
/// message is not of the type the tagger expects.
pub type TaggerFn = Func<dyn Fn(Message) -> Option<Message>>;

/// Stacked taggers, outermost first. Nesting beyond two is rare.
pub type TaggerStack = SmallVec<[TaggerFn; 2]>;

/// Builds a thunk's subtree from its arguments.
pub type ThunkFn = dyn Fn(&[Rc<dyn Any>]) -> Option<Node>;

/// Renders a custom node's model into the document.
pub type CustomRenderFn = dyn Fn(&dyn Any, &mut dyn Document) -> NodeId;

/// Compares two custom models and produces a host patch when they differ.
pub type CustomDiffFn = dyn Fn(&dyn Any, &dyn Any) -> Option<CustomPatch>;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A virtual node.
#[derive(Clone, Debug)]
pub enum Node {
    Text(Rc<str>),
    Element(Rc<Element>),
    Keyed(Rc<KeyedElement>),
    Custom(Rc<Custom>),
    Tagger(Rc<Tagger>),
    Thunk(Rc<Thunk>),
}

/// An element with positional children.
#[derive(Clone, Debug)]
pub struct Element {
    pub tag: String,
    pub namespace: Option<String>,
    pub facts: Facts,
    pub children: Vec<Node>,
    pub(crate) descendants: usize,
}

/// An element whose children are identified by key.
#[derive(Clone, Debug)]
pub struct KeyedElement {
    pub tag: String,
    pub namespace: Option<String>,
    pub facts: Facts,
    pub children: Vec<(String, Node)>,
    pub(crate) descendants: usize,
}

/// A leaf rendered by user code rather than by the kernel.
#[derive(Clone)]
pub struct Custom {
    pub facts: Facts,
    pub model: Rc<dyn Any>,
    pub render: Func<CustomRenderFn>,
    pub diff: Func<CustomDiffFn>,
}

impl fmt::Debug for Custom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Custom")
            .field("facts", &self.facts)
            .field("render", &self.render)
            .finish_non_exhaustive()
    }
}

/// Wraps a subtree and transforms every message it produces.
#[derive(Clone, Debug)]
pub struct Tagger {
    pub map: TaggerFn,
    pub inner: Node,
    pub(crate) descendants: usize,
}

/// A deferred subtree, rebuilt only when its view or arguments change.
pub struct Thunk {
    view: Func<ThunkFn>,
    args: Vec<Rc<dyn Any>>,
    cached: RefCell<Option<Node>>,
    builds: Cell<usize>,
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thunk")
            .field("view", &self.view)
            .field("args", &self.args.len())
            .field("built", &self.cached.borrow().is_some())
            .finish()
    }
}

impl Thunk {
    /// Whether both thunks have the same view and reference-identical
    /// arguments, in which case their subtrees are interchangeable.
    pub fn same_inputs(&self, other: &Thunk) -> bool {
        self.view.same(&other.view)
            && self.args.len() == other.args.len()
            && self
                .args
                .iter()
                .zip(&other.args)
                .all(|(a, b)| std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)))
    }

    /// The subtree, building it on first use.
    pub fn force(&self) -> Node {
        if let Some(node) = self.cached.borrow().clone() {
            return node;
        }
        self.builds.set(self.builds.get() + 1);
        let built = (self.view.get())(&self.args).unwrap_or_else(|| Node::text(""));
        *self.cached.borrow_mut() = Some(built.clone());
        built
    }

    /// The subtree if it has already been built.
    pub fn cached(&self) -> Option<Node> {
        self.cached.borrow().clone()
    }

    /// How many times this thunk value has run its view.
    pub fn build_count(&self) -> usize {
        self.builds.get()
    }

    pub(crate) fn adopt(&self, node: Node) {
        *self.cached.borrow_mut() = Some(node);
    }
}

impl Node {
    /// A text leaf.
    pub fn text(text: impl AsRef<str>) -> Self {
        Node::Text(Rc::from(text.as_ref()))
    }

    /// An element without a namespace.
    pub fn element(tag: impl Into<String>, facts: Vec<Fact>, children: Vec<Node>) -> Self {
        Self::element_ns(None, tag, facts, children)
    }

    /// An element in an optional namespace (for SVG and similar).
    pub fn element_ns(
        namespace: Option<String>,
        tag: impl Into<String>,
        facts: Vec<Fact>,
        children: Vec<Node>,
    ) -> Self {
        let descendants = children.iter().map(|c| 1 + c.descendants()).sum();
        Node::Element(Rc::new(Element {
            tag: tag.into(),
            namespace,
            facts: Facts::organize(facts),
            children,
            descendants,
        }))
    }

    /// A keyed element without a namespace.
    pub fn keyed(tag: impl Into<String>, facts: Vec<Fact>, children: Vec<(String, Node)>) -> Self {
        Self::keyed_ns(None, tag, facts, children)
    }

    /// A keyed element in an optional namespace.
    pub fn keyed_ns(
        namespace: Option<String>,
        tag: impl Into<String>,
        facts: Vec<Fact>,
        children: Vec<(String, Node)>,
    ) -> Self {
        let descendants = children.iter().map(|(_, c)| 1 + c.descendants()).sum();
        Node::Keyed(Rc::new(KeyedElement {
            tag: tag.into(),
            namespace,
            facts: Facts::organize(facts),
            children,
            descendants,
        }))
    }

    /// Wrap `inner` so its messages pass through `map`.
    pub fn tagger(map: TaggerFn, inner: Node) -> Self {
        let descendants = 1 + inner.descendants();
        Node::Tagger(Rc::new(Tagger {
            map,
            inner,
            descendants,
        }))
    }

    /// A lazily built subtree.
    pub fn thunk(view: Func<ThunkFn>, args: Vec<Rc<dyn Any>>) -> Self {
        Node::Thunk(Rc::new(Thunk {
            view,
            args,
            cached: RefCell::new(None),
            builds: Cell::new(0),
        }))
    }

    /// A host-rendered leaf.
    pub fn custom(
        facts: Vec<Fact>,
        model: Rc<dyn Any>,
        render: Func<CustomRenderFn>,
        diff: Func<CustomDiffFn>,
    ) -> Self {
        Node::Custom(Rc::new(Custom {
            facts: Facts::organize(facts),
            model,
            render,
            diff,
        }))
    }

    /// Number of live-tree positions below this node.
    pub fn descendants(&self) -> usize {
        match self {
            Node::Element(e) => e.descendants,
            Node::Keyed(k) => k.descendants,
            Node::Tagger(t) => t.descendants,
            Node::Text(_) | Node::Custom(_) | Node::Thunk(_) => 0,
        }
    }

    /// Whether both values are the same allocation.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Text(a), Node::Text(b)) => Rc::ptr_eq(a, b),
            (Node::Element(a), Node::Element(b)) => Rc::ptr_eq(a, b),
            (Node::Keyed(a), Node::Keyed(b)) => Rc::ptr_eq(a, b),
            (Node::Custom(a), Node::Custom(b)) => Rc::ptr_eq(a, b),
            (Node::Tagger(a), Node::Tagger(b)) => Rc::ptr_eq(a, b),
            (Node::Thunk(a), Node::Thunk(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl KeyedElement {
    /// The same element with its keys dropped.
    pub(crate) fn dekey(&self) -> Element {
        Element {
            tag: self.tag.clone(),
            namespace: self.namespace.clone(),
            facts: self.facts.clone(),
            children: self.children.iter().map(|(_, n)| n.clone()).collect(),
            descendants: self.descendants,
        }
    }
}

/// Strip nested taggers, returning them outermost first with the first
/// non-tagger node below them.
pub(crate) fn gather_taggers(tagger: &Tagger) -> (TaggerStack, &Node) {
    let mut taggers: TaggerStack = smallvec![tagger.map.clone()];
    let mut inner = &tagger.inner;
    while let Node::Tagger(next) = inner {
        taggers.push(next.map.clone());
        inner = &next.inner;
    }
    (taggers, inner)
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// One unorganized fact, as produced by attribute builders.
#[derive(Clone, Debug, PartialEq)]
pub enum Fact {
    Property(String, Value),
    Attribute(String, String),
    AttributeNs {
        namespace: String,
        key: String,
        value: String,
    },
    Style(String, String),
    Event(String, Handler),
}

/// Facts of one node, partitioned by category. Keys are kept sorted so
/// patch output is deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Facts {
    pub properties: BTreeMap<String, Value>,
    pub attributes: BTreeMap<String, String>,
    /// Namespaced attributes: key to `(namespace, value)`.
    pub namespaced: BTreeMap<String, (String, String)>,
    pub styles: BTreeMap<String, String>,
    pub events: BTreeMap<String, Handler>,
}

impl Facts {
    /// Partition a fact list into categories.
    pub fn organize(facts: impl IntoIterator<Item = Fact>) -> Self {
        let mut out = Facts::default();
        for fact in facts {
            match fact {
                Fact::Property(key, value) => {
                    if key == "className" {
                        if let (Some(Value::String(prev)), Value::String(next)) =
                            (out.properties.get(&key), &value)
                        {
                            let joined = format!("{prev} {next}");
                            out.properties.insert(key, Value::String(joined));
                            continue;
                        }
                    }
                    out.properties.insert(key, value);
                }
                Fact::Attribute(key, value) => {
                    let value = match (key.as_str(), out.attributes.get(&key)) {
                        ("class", Some(prev)) => format!("{prev} {value}"),
                        _ => value,
                    };
                    out.attributes.insert(key, value);
                }
                Fact::AttributeNs {
                    namespace,
                    key,
                    value,
                } => {
                    out.namespaced.insert(key, (namespace, value));
                }
                Fact::Style(key, value) => {
                    out.styles.insert(key, value);
                }
                Fact::Event(name, handler) => {
                    out.events.insert(name, handler);
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
            && self.attributes.is_empty()
            && self.namespaced.is_empty()
            && self.styles.is_empty()
            && self.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Event handlers
// ---------------------------------------------------------------------------

/// How a handler's decoded value controls propagation and default action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Decodes a message; never stops or prevents.
    Normal,
    /// Decodes `(message, stop_propagation)`.
    MayStopPropagation,
    /// Decodes `(message, prevent_default)`.
    MayPreventDefault,
    /// Decodes a [`CustomEvent`].
    Custom,
}

impl HandlerKind {
    /// Listeners that can never prevent the default action are registered
    /// as passive.
    pub fn passive(self) -> bool {
        matches!(self, HandlerKind::Normal | HandlerKind::MayStopPropagation)
    }
}

/// What a handler asks of the dispatcher once its decoder succeeded.
#[derive(Clone, Debug, PartialEq)]
pub struct CustomEvent<Msg> {
    pub message: Msg,
    pub stop_propagation: bool,
    pub prevent_default: bool,
}

/// An erased handler result.
pub struct EventOutcome {
    pub message: Message,
    pub stop_propagation: bool,
    pub prevent_default: bool,
}

impl fmt::Debug for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventOutcome")
            .field("stop_propagation", &self.stop_propagation)
            .field("prevent_default", &self.prevent_default)
            .finish_non_exhaustive()
    }
}

/// Splits a decoder's output into an [`EventOutcome`]. `None` means the
/// output had an unexpected type.
pub type Unpack = fn(Output) -> Option<EventOutcome>;

/// An event handler: a decoder over the event payload plus its kind.
#[derive(Clone, Debug)]
pub struct Handler {
    pub kind: HandlerKind,
    pub decoder: RawDecoder,
    pub(crate) unpack: Unpack,
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.decoder == other.decoder
    }
}

impl Handler {
    /// Assemble a handler. `unpack` must accept whatever `decoder` produces.
    pub fn new(kind: HandlerKind, decoder: RawDecoder, unpack: Unpack) -> Self {
        Self {
            kind,
            decoder,
            unpack,
        }
    }

    /// Run the decoder against an event payload.
    pub fn handle(&self, payload: &Value) -> Result<Option<EventOutcome>, vela_json::DecodeError> {
        let output = self.decoder.run(payload)?;
        Ok((self.unpack)(output))
    }
}

/// Unpack for [`HandlerKind::Normal`]: the output is the message itself.
pub fn unpack_message(output: Output) -> Option<EventOutcome> {
    Some(EventOutcome {
        message: output,
        stop_propagation: false,
        prevent_default: false,
    })
}

/// Unpack for [`HandlerKind::MayStopPropagation`].
pub fn unpack_stop<Msg: 'static>(output: Output) -> Option<EventOutcome> {
    let (message, stop) = *output.downcast::<(Msg, bool)>().ok()?;
    Some(EventOutcome {
        message: Box::new(message),
        stop_propagation: stop,
        prevent_default: false,
    })
}

/// Unpack for [`HandlerKind::MayPreventDefault`].
pub fn unpack_prevent<Msg: 'static>(output: Output) -> Option<EventOutcome> {
    let (message, prevent) = *output.downcast::<(Msg, bool)>().ok()?;
    Some(EventOutcome {
        message: Box::new(message),
        stop_propagation: false,
        prevent_default: prevent,
    })
}

/// Unpack for [`HandlerKind::Custom`].
pub fn unpack_custom<Msg: 'static>(output: Output) -> Option<EventOutcome> {
    let event = *output.downcast::<CustomEvent<Msg>>().ok()?;
    Some(EventOutcome {
        message: Box::new(event.message),
        stop_propagation: event.stop_propagation,
        prevent_default: event.prevent_default,
    })
}
