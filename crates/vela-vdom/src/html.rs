#![forbid(unsafe_code)]

//! Typed view builders.
//!
//! [`Html<Msg>`] and [`Attribute<Msg>`] are thin wrappers over [`Node`] and
//! [`Fact`] that pin down the message type a view can produce, so a program
//! can only ever receive its own messages. [`Html::map`] installs a tagger
//! to embed a child view with a different message type.
//!
//! Handlers and taggers built here from non-capturing closures keep the
//! same identity across renders, which lets the diff skip them.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

use serde_json::Value;
use vela_json::{Decoder, decode, func};

use crate::node::{
    CustomEvent, Fact, Handler, HandlerKind, Message, Node, ThunkFn, unpack_custom,
    unpack_message, unpack_prevent, unpack_stop,
};

/// A view producing messages of type `Msg`.
pub struct Html<Msg> {
    node: Node,
    _msg: PhantomData<fn() -> Msg>,
}

impl<Msg> Clone for Html<Msg> {
    fn clone(&self) -> Self {
        Self::wrap(self.node.clone())
    }
}

impl<Msg> std::fmt::Debug for Html<Msg> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.node.fmt(f)
    }
}

impl<Msg> Html<Msg> {
    fn wrap(node: Node) -> Self {
        Self {
            node,
            _msg: PhantomData,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }
}

impl<Msg: 'static> Html<Msg> {
    /// Embed this view in a parent whose messages have type `B`.
    pub fn map<B: 'static>(self, f: impl Fn(Msg) -> B + 'static) -> Html<B> {
        let tagger = func!(dyn Fn(Message) -> Option<Message>, move |m: Message| {
            let msg = m.downcast::<Msg>().ok()?;
            Some(Box::new(f(*msg)) as Message)
        });
        Html::wrap(Node::tagger(tagger, self.node))
    }
}

/// A fact producing messages of type `Msg`.
pub struct Attribute<Msg> {
    fact: Fact,
    _msg: PhantomData<fn() -> Msg>,
}

impl<Msg> Clone for Attribute<Msg> {
    fn clone(&self) -> Self {
        Self::wrap(self.fact.clone())
    }
}

impl<Msg> std::fmt::Debug for Attribute<Msg> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fact.fmt(f)
    }
}

impl<Msg> Attribute<Msg> {
    fn wrap(fact: Fact) -> Self {
        Self {
            fact,
            _msg: PhantomData,
        }
    }

    pub fn into_fact(self) -> Fact {
        self.fact
    }
}

fn facts<Msg>(attrs: Vec<Attribute<Msg>>) -> Vec<Fact> {
    attrs.into_iter().map(Attribute::into_fact).collect()
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

pub fn text<Msg>(content: impl AsRef<str>) -> Html<Msg> {
    Html::wrap(Node::text(content))
}

pub fn node<Msg>(tag: &str, attrs: Vec<Attribute<Msg>>, children: Vec<Html<Msg>>) -> Html<Msg> {
    Html::wrap(Node::element(
        tag,
        facts(attrs),
        children.into_iter().map(Html::into_node).collect(),
    ))
}

pub fn node_ns<Msg>(
    namespace: &str,
    tag: &str,
    attrs: Vec<Attribute<Msg>>,
    children: Vec<Html<Msg>>,
) -> Html<Msg> {
    Html::wrap(Node::element_ns(
        Some(namespace.to_owned()),
        tag,
        facts(attrs),
        children.into_iter().map(Html::into_node).collect(),
    ))
}

pub fn keyed_node<Msg>(
    tag: &str,
    attrs: Vec<Attribute<Msg>>,
    children: Vec<(String, Html<Msg>)>,
) -> Html<Msg> {
    Html::wrap(Node::keyed(
        tag,
        facts(attrs),
        children
            .into_iter()
            .map(|(key, child)| (key, child.into_node()))
            .collect(),
    ))
}

macro_rules! tags {
    ($($name:ident),* $(,)?) => {
        $(
            #[doc = concat!("`<", stringify!($name), ">`")]
            pub fn $name<Msg>(attrs: Vec<Attribute<Msg>>, children: Vec<Html<Msg>>) -> Html<Msg> {
                node(stringify!($name), attrs, children)
            }
        )*
    };
}

tags!(div, span, p, a, button, input, label, form, ul, ol, li, h1, h2, section);

/// A subtree built by `view(arg)` only when `view` or `arg` changed since
/// the previous render. `arg` is compared by reference.
///
/// `view` should be a function item or non-capturing closure so that it is
/// recognized as the same view on every render.
pub fn lazy<A, Msg, F>(view: F, arg: Rc<A>) -> Html<Msg>
where
    A: 'static,
    Msg: 'static,
    F: Fn(&A) -> Html<Msg> + 'static,
{
    let build = func!(ThunkFn, move |args: &[Rc<dyn Any>]| {
        let a = args.first()?.downcast_ref::<A>()?;
        Some(view(a).into_node())
    });
    Html::wrap(Node::thunk(build, vec![arg as Rc<dyn Any>]))
}

/// Two-argument [`lazy`].
pub fn lazy2<A, B, Msg, F>(view: F, a: Rc<A>, b: Rc<B>) -> Html<Msg>
where
    A: 'static,
    B: 'static,
    Msg: 'static,
    F: Fn(&A, &B) -> Html<Msg> + 'static,
{
    let build = func!(ThunkFn, move |args: &[Rc<dyn Any>]| {
        let a = args.first()?.downcast_ref::<A>()?;
        let b = args.get(1)?.downcast_ref::<B>()?;
        Some(view(a, b).into_node())
    });
    Html::wrap(Node::thunk(
        build,
        vec![a as Rc<dyn Any>, b as Rc<dyn Any>],
    ))
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

pub fn property<Msg>(key: &str, value: Value) -> Attribute<Msg> {
    Attribute::wrap(Fact::Property(key.to_owned(), value))
}

pub fn attribute<Msg>(key: &str, value: impl Into<String>) -> Attribute<Msg> {
    Attribute::wrap(Fact::Attribute(key.to_owned(), value.into()))
}

pub fn attribute_ns<Msg>(namespace: &str, key: &str, value: impl Into<String>) -> Attribute<Msg> {
    Attribute::wrap(Fact::AttributeNs {
        namespace: namespace.to_owned(),
        key: key.to_owned(),
        value: value.into(),
    })
}

pub fn style<Msg>(key: &str, value: impl Into<String>) -> Attribute<Msg> {
    Attribute::wrap(Fact::Style(key.to_owned(), value.into()))
}

/// The `class` attribute. Repeated uses accumulate.
pub fn class<Msg>(name: impl Into<String>) -> Attribute<Msg> {
    attribute("class", name)
}

pub fn id<Msg>(value: impl Into<String>) -> Attribute<Msg> {
    attribute("id", value)
}

/// The `value` property, kept in sync even after user edits.
pub fn value<Msg>(value: impl Into<String>) -> Attribute<Msg> {
    property("value", Value::String(value.into()))
}

/// The `checked` property.
pub fn checked<Msg>(checked: bool) -> Attribute<Msg> {
    property("checked", Value::Bool(checked))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Handle `event` with a decoder producing the message.
pub fn on<Msg: 'static>(event: &str, decoder: Decoder<Msg>) -> Attribute<Msg> {
    let handler = Handler::new(HandlerKind::Normal, decoder.erase(), unpack_message);
    Attribute::wrap(Fact::Event(event.to_owned(), handler))
}

/// Handle `event`; the decoder also says whether to stop propagation.
pub fn stop_propagation_on<Msg: 'static>(event: &str, decoder: Decoder<(Msg, bool)>) -> Attribute<Msg> {
    let handler = Handler::new(
        HandlerKind::MayStopPropagation,
        decoder.erase(),
        unpack_stop::<Msg>,
    );
    Attribute::wrap(Fact::Event(event.to_owned(), handler))
}

/// Handle `event`; the decoder also says whether to prevent the default.
pub fn prevent_default_on<Msg: 'static>(event: &str, decoder: Decoder<(Msg, bool)>) -> Attribute<Msg> {
    let handler = Handler::new(
        HandlerKind::MayPreventDefault,
        decoder.erase(),
        unpack_prevent::<Msg>,
    );
    Attribute::wrap(Fact::Event(event.to_owned(), handler))
}

/// Handle `event` with full control over propagation and default action.
pub fn custom_on<Msg: 'static>(event: &str, decoder: Decoder<CustomEvent<Msg>>) -> Attribute<Msg> {
    let handler = Handler::new(HandlerKind::Custom, decoder.erase(), unpack_custom::<Msg>);
    Attribute::wrap(Fact::Event(event.to_owned(), handler))
}

/// Send `msg` on click.
pub fn on_click<Msg: Clone + PartialEq + 'static>(msg: Msg) -> Attribute<Msg> {
    on("click", decode::succeed(msg))
}

/// Send `f(target.value)` on input. Stops propagation.
pub fn on_input<Msg: 'static>(f: impl Fn(String) -> Msg + 'static) -> Attribute<Msg> {
    let decoder = decode::at(&["target", "value"], decode::string()).map(move |s| (f(s), true));
    stop_propagation_on("input", decoder)
}

/// Send `f(target.checked)` on change.
pub fn on_check<Msg: 'static>(f: impl Fn(bool) -> Msg + 'static) -> Attribute<Msg> {
    on("change", decode::at(&["target", "checked"], decode::bool()).map(f))
}

/// Send `msg` on submit and prevent the default form submission.
pub fn on_submit<Msg: Clone + PartialEq + 'static>(msg: Msg) -> Attribute<Msg> {
    prevent_default_on("submit", decode::succeed(msg).map(|m| (m, true)))
}
