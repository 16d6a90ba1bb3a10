#![forbid(unsafe_code)]

//! JSON decoding and encoding for the Vela UI kernel.
//!
//! Host payloads (DOM events, HTTP bodies, port messages, program flags) are
//! untyped JSON. This crate turns them into typed values through
//! [`Decoder`]s, which are plain data: they can be built ahead of time,
//! compared structurally, and interpreted against any number of values.
//!
//! - [`decode`]: decoder constructors and the interpreter.
//! - [`encode`]: helpers for producing JSON from Rust values.
//! - [`DecodeError`]: the structured failure tree and its rendering.
//! - [`Func`]: shared functions with identity, used wherever the kernel must
//!   decide whether two closures are "the same".

pub mod decode;
pub mod encode;
pub mod error;
pub mod func;

pub use decode::{Decoder, Output, RawDecoder};
pub use error::DecodeError;
pub use func::Func;
pub use serde_json::Value;
