#![forbid(unsafe_code)]

//! Vela: a single-threaded reactive UI kernel.
//!
//! This crate re-exports the layers of the kernel:
//!
//! - [`json`]: data-described decoders and encoders;
//! - [`vdom`]: virtual nodes, diffing and the live tree;
//! - [`runtime`]: tasks, the scheduler, effect managers and the program
//!   loop (feature `runtime`, on by default).
//!
//! Most applications only need the [`prelude`].
//!
//! ```
//! use vela::prelude::*;
//!
//! let view: Html<()> = html::div(vec![html::class("greeting")], vec![html::text("hi")]);
//! let flags: Decoder<String> = decode::field("name", decode::string());
//! assert!(flags.run(&Value::from(0)).is_err());
//! # let _ = view;
//! ```

pub use vela_json as json;
#[cfg(feature = "runtime")]
pub use vela_runtime as runtime;
pub use vela_vdom as vdom;

/// Everything an application module usually imports.
pub mod prelude {
    pub use vela_json::{DecodeError, Decoder, Value, decode, encode};
    pub use vela_vdom::html::{self, Attribute};
    pub use vela_vdom::{Document, Html, MemoryDocument, NodeId};

    #[cfg(feature = "runtime")]
    pub use vela_runtime::managers::{animation, events, http, ports, time};
    #[cfg(feature = "runtime")]
    pub use vela_runtime::{
        Application, Cmd, EventTarget, Host, Never, Posix, Program, ProgramConfig, Registry,
        RuntimeError, SimulatedHost, Sub, Task, attempt, perform,
    };
}
