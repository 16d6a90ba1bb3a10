#![forbid(unsafe_code)]

//! Shared function values with a notion of identity.
//!
//! Decoders, taggers and thunks all hold user functions, and the diff engine
//! needs to know whether two of them are "the same function". [`Func`] answers
//! that question without comparing behavior:
//!
//! - A function whose concrete type is zero-sized (fn items, non-capturing
//!   closures, closures that only capture zero-sized values) is identified by
//!   its type. Two `Func`s built from the same closure expression compare equal
//!   even when they were built on different renders.
//! - Anything else is identified by its allocation: clones of one `Func` are
//!   equal, separately built ones are not.
//!
//! # Invariants
//!
//! 1. `a.same(&a.clone())` always holds.
//! 2. Equality never calls the function.

use std::any::TypeId;
use std::fmt;
use std::rc::Rc;

/// A reference-counted function with an identity usable for equality.
pub struct Func<F: ?Sized> {
    inner: Rc<F>,
    stateless: Option<TypeId>,
}

impl<F: ?Sized> Func<F> {
    /// Assemble a `Func` from an already-erased function and the identity of
    /// its concrete type (see [`stateless_id`]).
    pub fn from_parts(inner: Rc<F>, stateless: Option<TypeId>) -> Self {
        Self { inner, stateless }
    }

    /// Borrow the function.
    #[inline]
    pub fn get(&self) -> &F {
        &self.inner
    }

    /// Whether two functions are known to be the same function.
    pub fn same(&self, other: &Self) -> bool {
        match (self.stateless, other.stateless) {
            (Some(a), Some(b)) => a == b,
            _ => std::ptr::addr_eq(Rc::as_ptr(&self.inner), Rc::as_ptr(&other.inner)),
        }
    }
}

impl<F: ?Sized> Clone for Func<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            stateless: self.stateless,
        }
    }
}

impl<F: ?Sized> fmt::Debug for Func<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stateless {
            Some(_) => f.write_str("Func(stateless)"),
            None => write!(f, "Func({:p})", Rc::as_ptr(&self.inner).cast::<()>()),
        }
    }
}

/// Type identity of `value` when its type carries no state.
#[inline]
pub fn stateless_id<G: 'static>(_value: &G) -> Option<TypeId> {
    (std::mem::size_of::<G>() == 0).then(TypeId::of::<G>)
}

/// Build a `Func` over a `dyn Fn` signature from a concrete closure.
///
/// ```
/// use vela_json::func;
/// let double = func!(dyn Fn(i64) -> i64, |x: i64| x * 2);
/// assert_eq!((double.get())(4), 8);
/// ```
#[macro_export]
macro_rules! func {
    ($sig:ty, $f:expr) => {{
        let f = $f;
        let id = $crate::func::stateless_id(&f);
        let rc: ::std::rc::Rc<$sig> = ::std::rc::Rc::new(f);
        $crate::func::Func::from_parts(rc, id)
    }};
}
