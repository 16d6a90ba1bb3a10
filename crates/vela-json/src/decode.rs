#![forbid(unsafe_code)]

//! Decoders: data-described recipes for extracting typed values from JSON.
//!
//! A [`Decoder<T>`] is a typed handle over an untyped operation tree. Building
//! a decoder never touches any JSON; [`Decoder::run`] interprets the tree
//! against a host value with a direct structural walk.
//!
//! # Invariants
//!
//! 1. Decoders are pure data: running one twice on the same value yields the
//!    same result.
//! 2. Projections (`field`, `index`, `list` items, `key_value_pairs` entries)
//!    annotate failures with the path segment they took.
//! 3. `one_of` reports the first success; only when every alternative fails
//!    are the failures aggregated, in attempt order.
//! 4. Equality is structural. Functions inside `map`/`and_then`/`lazy` compare
//!    by [`Func`] identity; `succeed` constants compare by value.
//!
//! # Example
//!
//! ```
//! use vela_json::decode::{self, Decoder};
//! use serde_json::json;
//!
//! let point: Decoder<(i64, i64)> =
//!     decode::map2(decode::field("x", decode::int()), decode::field("y", decode::int()), |x, y| (x, y));
//! assert_eq!(point.run(&json!({"x": 1, "y": 2})), Ok((1, 2)));
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use serde_json::Value;

use crate::error::DecodeError;
use crate::func::Func;

/// An erased decoded value.
pub type Output = Box<dyn Any>;

type MapFn = dyn Fn(Vec<Output>) -> Option<Output>;
type ThenFn = dyn Fn(Output) -> Option<Rc<Op>>;
type LazyFn = dyn Fn() -> Rc<Op>;
type Collect = fn(Vec<Output>) -> Option<Output>;
type CollectPairs = fn(Vec<(String, Output)>) -> Option<Output>;

const TYPE_MISMATCH: &str = "A decoder produced a value of an unexpected type";

/// Constant values produced by `succeed` and `null`.
trait Constant {
    fn produce(&self) -> Output;
    fn same(&self, other: &dyn Constant) -> bool;
    fn as_any(&self) -> &dyn Any;
}

struct Equatable<T>(T);

impl<T: Clone + PartialEq + 'static> Constant for Equatable<T> {
    fn produce(&self) -> Output {
        Box::new(self.0.clone())
    }

    fn same(&self, other: &dyn Constant) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| other.0 == self.0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Defaulted<T>(PhantomData<fn() -> T>);

impl<T: Default + 'static> Constant for Defaulted<T> {
    fn produce(&self) -> Output {
        Box::new(T::default())
    }

    fn same(&self, other: &dyn Constant) -> bool {
        other.as_any().is::<Self>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One node of the untyped decoder tree.
enum Op {
    Bool,
    Int,
    Float,
    Str,
    Value,
    Null(Rc<dyn Constant>),
    Succeed(Rc<dyn Constant>),
    Fail(Rc<str>),
    List(Rc<Op>, Collect),
    KeyValue(Rc<Op>, CollectPairs),
    Field(Rc<str>, Rc<Op>),
    Index(usize, Rc<Op>),
    Map(Func<MapFn>, Vec<Rc<Op>>),
    AndThen(Func<ThenFn>, Rc<Op>),
    OneOf(Vec<Rc<Op>>),
    Lazy(Func<LazyFn>),
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Op::Bool, Op::Bool)
            | (Op::Int, Op::Int)
            | (Op::Float, Op::Float)
            | (Op::Str, Op::Str)
            | (Op::Value, Op::Value) => true,
            (Op::Null(a), Op::Null(b)) | (Op::Succeed(a), Op::Succeed(b)) => a.same(&**b),
            (Op::Fail(a), Op::Fail(b)) => a == b,
            (Op::List(a, ca), Op::List(b, cb)) => {
                std::ptr::fn_addr_eq(*ca, *cb) && same_op(a, b)
            }
            (Op::KeyValue(a, ca), Op::KeyValue(b, cb)) => {
                std::ptr::fn_addr_eq(*ca, *cb) && same_op(a, b)
            }
            (Op::Field(na, a), Op::Field(nb, b)) => na == nb && same_op(a, b),
            (Op::Index(ia, a), Op::Index(ib, b)) => ia == ib && same_op(a, b),
            (Op::Map(fa, a), Op::Map(fb, b)) => fa.same(fb) && same_ops(a, b),
            (Op::AndThen(fa, a), Op::AndThen(fb, b)) => fa.same(fb) && same_op(a, b),
            (Op::OneOf(a), Op::OneOf(b)) => same_ops(a, b),
            (Op::Lazy(a), Op::Lazy(b)) => a.same(b),
            _ => false,
        }
    }
}

fn same_op(a: &Rc<Op>, b: &Rc<Op>) -> bool {
    Rc::ptr_eq(a, b) || a.as_ref() == b.as_ref()
}

fn same_ops(a: &[Rc<Op>], b: &[Rc<Op>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| same_op(a, b))
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Bool => f.write_str("bool"),
            Op::Int => f.write_str("int"),
            Op::Float => f.write_str("float"),
            Op::Str => f.write_str("string"),
            Op::Value => f.write_str("value"),
            Op::Null(_) => f.write_str("null"),
            Op::Succeed(_) => f.write_str("succeed"),
            Op::Fail(msg) => write!(f, "fail({msg:?})"),
            Op::List(item, _) => write!(f, "list({item:?})"),
            Op::KeyValue(item, _) => write!(f, "key_value_pairs({item:?})"),
            Op::Field(name, inner) => write!(f, "field({name:?}, {inner:?})"),
            Op::Index(i, inner) => write!(f, "index({i}, {inner:?})"),
            Op::Map(_, ops) => f.debug_tuple("map").field(ops).finish(),
            Op::AndThen(_, inner) => write!(f, "and_then({inner:?})"),
            Op::OneOf(ops) => f.debug_tuple("one_of").field(ops).finish(),
            Op::Lazy(_) => f.write_str("lazy"),
        }
    }
}

fn run_op(op: &Op, value: &Value) -> Result<Output, DecodeError> {
    match op {
        Op::Bool => value
            .as_bool()
            .map(|b| Box::new(b) as Output)
            .ok_or_else(|| DecodeError::failure("Expecting a BOOL", value)),
        Op::Int => as_int(value)
            .map(|i| Box::new(i) as Output)
            .ok_or_else(|| DecodeError::failure("Expecting an INT", value)),
        Op::Float => value
            .as_f64()
            .map(|x| Box::new(x) as Output)
            .ok_or_else(|| DecodeError::failure("Expecting a FLOAT", value)),
        Op::Str => value
            .as_str()
            .map(|s| Box::new(s.to_owned()) as Output)
            .ok_or_else(|| DecodeError::failure("Expecting a STRING", value)),
        Op::Value => Ok(Box::new(value.clone())),
        Op::Null(constant) => {
            if value.is_null() {
                Ok(constant.produce())
            } else {
                Err(DecodeError::failure("Expecting null", value))
            }
        }
        Op::Succeed(constant) => Ok(constant.produce()),
        Op::Fail(message) => Err(DecodeError::failure(message.to_string(), value)),
        Op::List(item, collect) => {
            let Value::Array(items) = value else {
                return Err(DecodeError::failure("Expecting a LIST", value));
            };
            let mut out = Vec::with_capacity(items.len());
            for (i, entry) in items.iter().enumerate() {
                out.push(run_op(item, entry).map_err(|err| DecodeError::index(i, err))?);
            }
            collect(out).ok_or_else(|| DecodeError::failure(TYPE_MISMATCH, value))
        }
        Op::KeyValue(item, collect) => {
            let Value::Object(map) = value else {
                return Err(DecodeError::failure("Expecting an OBJECT", value));
            };
            let mut out = Vec::with_capacity(map.len());
            for (key, entry) in map {
                let decoded = run_op(item, entry).map_err(|err| DecodeError::field(key, err))?;
                out.push((key.clone(), decoded));
            }
            collect(out).ok_or_else(|| DecodeError::failure(TYPE_MISMATCH, value))
        }
        Op::Field(name, inner) => {
            let Value::Object(map) = value else {
                return Err(DecodeError::field(
                    name,
                    DecodeError::failure(
                        format!("Expecting an OBJECT with a field named `{name}`"),
                        value,
                    ),
                ));
            };
            match map.get(&**name) {
                Some(entry) => run_op(inner, entry).map_err(|err| DecodeError::field(name, err)),
                None => Err(DecodeError::field(
                    name,
                    DecodeError::failure(
                        format!("Expecting an OBJECT with a field named `{name}`"),
                        value,
                    ),
                )),
            }
        }
        Op::Index(index, inner) => {
            let Value::Array(items) = value else {
                return Err(DecodeError::index(
                    *index,
                    DecodeError::failure("Expecting an ARRAY", value),
                ));
            };
            match items.get(*index) {
                Some(entry) => run_op(inner, entry).map_err(|err| DecodeError::index(*index, err)),
                None => Err(DecodeError::index(
                    *index,
                    DecodeError::failure(
                        format!(
                            "Expecting a LONGER array. Need index {index} but only see {} entries",
                            items.len()
                        ),
                        value,
                    ),
                )),
            }
        }
        Op::Map(f, ops) => {
            let mut args = Vec::with_capacity(ops.len());
            for op in ops {
                args.push(run_op(op, value)?);
            }
            (f.get())(args).ok_or_else(|| DecodeError::failure(TYPE_MISMATCH, value))
        }
        Op::AndThen(f, inner) => {
            let first = run_op(inner, value)?;
            let next = (f.get())(first).ok_or_else(|| DecodeError::failure(TYPE_MISMATCH, value))?;
            run_op(&next, value)
        }
        Op::OneOf(ops) => {
            let mut errors = Vec::new();
            for op in ops {
                match run_op(op, value) {
                    Ok(out) => return Ok(out),
                    Err(err) => errors.push(err),
                }
            }
            Err(DecodeError::OneOf(errors))
        }
        Op::Lazy(f) => run_op(&(f.get())(), value),
    }
}

fn as_int(value: &Value) -> Option<i64> {
    let number = value.as_number()?;
    if let Some(i) = number.as_i64() {
        return Some(i);
    }
    let x = number.as_f64()?;
    let integral = x.fract() == 0.0 && x >= i64::MIN as f64 && x < i64::MAX as f64;
    integral.then_some(x as i64)
}

fn collect_vec<T: 'static>(items: Vec<Output>) -> Option<Output> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(*item.downcast::<T>().ok()?);
    }
    Some(Box::new(out))
}

fn collect_boxed_slice<T: 'static>(items: Vec<Output>) -> Option<Output> {
    let vec = collect_vec::<T>(items)?.downcast::<Vec<T>>().ok()?;
    Some(Box::new(vec.into_boxed_slice()))
}

fn collect_pairs<T: 'static>(items: Vec<(String, Output)>) -> Option<Output> {
    let mut out = Vec::with_capacity(items.len());
    for (key, item) in items {
        out.push((key, *item.downcast::<T>().ok()?));
    }
    Some(Box::new(out))
}

fn collect_dict<T: 'static>(items: Vec<(String, Output)>) -> Option<Output> {
    let mut out = BTreeMap::new();
    for (key, item) in items {
        out.insert(key, *item.downcast::<T>().ok()?);
    }
    Some(Box::new(out))
}

// ---------------------------------------------------------------------------
// Decoder<T> / RawDecoder
// ---------------------------------------------------------------------------

/// A typed decoder producing `T`.
pub struct Decoder<T> {
    op: Rc<Op>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Decoder<T> {
    fn clone(&self) -> Self {
        Self {
            op: Rc::clone(&self.op),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Decoder<T> {
    fn eq(&self, other: &Self) -> bool {
        same_op(&self.op, &other.op)
    }
}

impl<T> fmt::Debug for Decoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decoder({:?})", self.op)
    }
}

impl<T: 'static> Decoder<T> {
    fn from_op(op: Op) -> Self {
        Self {
            op: Rc::new(op),
            _marker: PhantomData,
        }
    }

    /// Run the decoder against a host value.
    pub fn run(&self, value: &Value) -> Result<T, DecodeError> {
        let out = run_op(&self.op, value)?;
        out.downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| DecodeError::failure(TYPE_MISMATCH, value))
    }

    /// Transform the decoded value.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Decoder<U> {
        let erased = crate::func!(MapFn, move |mut args: Vec<Output>| {
            let value = args.pop()?.downcast::<T>().ok()?;
            Some(Box::new(f(*value)) as Output)
        });
        Decoder::from_op(Op::Map(erased, vec![Rc::clone(&self.op)]))
    }

    /// Decode, then pick the next decoder from the result and run it against
    /// the same value.
    pub fn and_then<U: 'static>(&self, f: impl Fn(T) -> Decoder<U> + 'static) -> Decoder<U> {
        let erased = crate::func!(ThenFn, move |out: Output| {
            let value = out.downcast::<T>().ok()?;
            Some(f(*value).op)
        });
        Decoder::from_op(Op::AndThen(erased, Rc::clone(&self.op)))
    }

    /// Erase the output type.
    pub fn erase(&self) -> RawDecoder {
        RawDecoder(Rc::clone(&self.op))
    }
}

/// A decoder whose output type has been erased.
///
/// Event handlers and effect payloads store decoders of many different
/// output types side by side; they keep the raw form and downcast at the
/// boundary where the type is known again.
#[derive(Clone)]
pub struct RawDecoder(Rc<Op>);

impl RawDecoder {
    /// Run the decoder, returning the erased output.
    pub fn run(&self, value: &Value) -> Result<Output, DecodeError> {
        run_op(&self.0, value)
    }

    /// Reattach an output type. Running the result with the wrong `T`
    /// yields a failure, never a panic.
    pub fn typed<T: 'static>(&self) -> Decoder<T> {
        Decoder {
            op: Rc::clone(&self.0),
            _marker: PhantomData,
        }
    }
}

impl PartialEq for RawDecoder {
    fn eq(&self, other: &Self) -> bool {
        same_op(&self.0, &other.0)
    }
}

impl fmt::Debug for RawDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawDecoder({:?})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Decode a JSON boolean.
pub fn bool() -> Decoder<bool> {
    Decoder::from_op(Op::Bool)
}

/// Decode an integer. Floats with no fractional part are accepted.
pub fn int() -> Decoder<i64> {
    Decoder::from_op(Op::Int)
}

/// Decode any JSON number as a float.
pub fn float() -> Decoder<f64> {
    Decoder::from_op(Op::Float)
}

/// Decode a JSON string.
pub fn string() -> Decoder<String> {
    Decoder::from_op(Op::Str)
}

/// Keep the raw JSON value.
pub fn value() -> Decoder<Value> {
    Decoder::from_op(Op::Value)
}

/// Accept only `null`, producing `fallback`.
pub fn null<T: Clone + PartialEq + 'static>(fallback: T) -> Decoder<T> {
    Decoder::from_op(Op::Null(Rc::new(Equatable(fallback))))
}

/// Always succeed with `value`, ignoring the input.
pub fn succeed<T: Clone + PartialEq + 'static>(value: T) -> Decoder<T> {
    Decoder::from_op(Op::Succeed(Rc::new(Equatable(value))))
}

/// Always fail with `message`.
pub fn fail<T: 'static>(message: impl Into<String>) -> Decoder<T> {
    let message: String = message.into();
    Decoder::from_op(Op::Fail(Rc::from(message)))
}

// ---------------------------------------------------------------------------
// Collections and projections
// ---------------------------------------------------------------------------

/// Decode a JSON array into a `Vec`.
pub fn list<T: 'static>(item: Decoder<T>) -> Decoder<Vec<T>> {
    Decoder::from_op(Op::List(item.op, collect_vec::<T>))
}

/// Decode a JSON array into a fixed-size boxed slice.
pub fn array<T: 'static>(item: Decoder<T>) -> Decoder<Box<[T]>> {
    Decoder::from_op(Op::List(item.op, collect_boxed_slice::<T>))
}

/// Decode every value of a JSON object, keeping key order.
pub fn key_value_pairs<T: 'static>(item: Decoder<T>) -> Decoder<Vec<(String, T)>> {
    Decoder::from_op(Op::KeyValue(item.op, collect_pairs::<T>))
}

/// Decode a JSON object into a sorted map.
pub fn dict<T: 'static>(item: Decoder<T>) -> Decoder<BTreeMap<String, T>> {
    Decoder::from_op(Op::KeyValue(item.op, collect_dict::<T>))
}

/// Decode the named field of an object.
pub fn field<T: 'static>(name: &str, inner: Decoder<T>) -> Decoder<T> {
    Decoder::from_op(Op::Field(Rc::from(name), inner.op))
}

/// Decode a nested field path, outermost first.
pub fn at<T: 'static>(path: &[&str], inner: Decoder<T>) -> Decoder<T> {
    path.iter()
        .rev()
        .fold(inner, |acc, name| field(name, acc))
}

/// Decode the element at `index` of an array.
pub fn index<T: 'static>(index: usize, inner: Decoder<T>) -> Decoder<T> {
    Decoder::from_op(Op::Index(index, inner.op))
}

/// Decode `null` as `None`, anything else with `inner`.
pub fn nullable<T: 'static>(inner: Decoder<T>) -> Decoder<Option<T>> {
    let null_as_none: Decoder<Option<T>> =
        Decoder::from_op(Op::Null(Rc::new(Defaulted::<Option<T>>(PhantomData))));
    one_of(vec![null_as_none, inner.map(Some)])
}

/// Decode with `inner`, turning any failure into `None`.
pub fn maybe<T: 'static>(inner: Decoder<T>) -> Decoder<Option<T>> {
    let none: Decoder<Option<T>> =
        Decoder::from_op(Op::Succeed(Rc::new(Defaulted::<Option<T>>(PhantomData))));
    one_of(vec![inner.map(Some), none])
}

/// Try each decoder in order, returning the first success.
pub fn one_of<T: 'static>(options: Vec<Decoder<T>>) -> Decoder<T> {
    Decoder::from_op(Op::OneOf(options.into_iter().map(|d| d.op).collect()))
}

/// Defer building a decoder until it runs. Needed for recursive shapes.
pub fn lazy<T: 'static>(build: impl Fn() -> Decoder<T> + 'static) -> Decoder<T> {
    let erased = crate::func!(LazyFn, move || build().op);
    Decoder::from_op(Op::Lazy(erased))
}

/// Transform the decoded value. Free-function form of [`Decoder::map`].
pub fn map<A: 'static, U: 'static>(a: Decoder<A>, f: impl Fn(A) -> U + 'static) -> Decoder<U> {
    a.map(f)
}

/// Combine two decoders run against the same value.
pub fn map2<A: 'static, B: 'static, U: 'static>(
    a: Decoder<A>,
    b: Decoder<B>,
    f: impl Fn(A, B) -> U + 'static,
) -> Decoder<U> {
    let erased = crate::func!(MapFn, move |args: Vec<Output>| {
        let mut args = args.into_iter();
        let a = args.next()?.downcast::<A>().ok()?;
        let b = args.next()?.downcast::<B>().ok()?;
        Some(Box::new(f(*a, *b)) as Output)
    });
    Decoder::from_op(Op::Map(erased, vec![a.op, b.op]))
}

/// Combine three decoders run against the same value.
pub fn map3<A: 'static, B: 'static, C: 'static, U: 'static>(
    a: Decoder<A>,
    b: Decoder<B>,
    c: Decoder<C>,
    f: impl Fn(A, B, C) -> U + 'static,
) -> Decoder<U> {
    let erased = crate::func!(MapFn, move |args: Vec<Output>| {
        let mut args = args.into_iter();
        let a = args.next()?.downcast::<A>().ok()?;
        let b = args.next()?.downcast::<B>().ok()?;
        let c = args.next()?.downcast::<C>().ok()?;
        Some(Box::new(f(*a, *b, *c)) as Output)
    });
    Decoder::from_op(Op::Map(erased, vec![a.op, b.op, c.op]))
}

/// Run every decoder against the same value, collecting the results.
pub fn all<T: 'static>(decoders: Vec<Decoder<T>>) -> Decoder<Vec<T>> {
    let erased = crate::func!(MapFn, |args: Vec<Output>| collect_vec::<T>(args));
    Decoder::from_op(Op::Map(erased, decoders.into_iter().map(|d| d.op).collect()))
}

/// Parse JSON text, then decode it.
pub fn decode_str<T: 'static>(decoder: &Decoder<T>, input: &str) -> Result<T, DecodeError> {
    let value: Value = serde_json::from_str(input).map_err(|err| {
        DecodeError::Failure(
            format!("This is not valid JSON! {err}"),
            Value::String(input.to_owned()),
        )
    })?;
    decoder.run(&value)
}
