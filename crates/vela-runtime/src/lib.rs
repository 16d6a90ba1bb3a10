#![forbid(unsafe_code)]

//! Cooperative scheduler, effect managers and the program loop.
//!
//! Side effects are described as values. A [`Task`] is deferred work run by
//! a [`Scheduler`] process; [`Cmd`] and [`Sub`] bags address effect
//! managers, long-lived processes that own timers, HTTP requests, host
//! event listeners and ports. A [`Program`] drives an [`Application`]:
//! each message updates the model, re-renders the view into a live tree
//! and hands the new commands and subscriptions to the managers.
//!
//! Everything runs on one thread. The outside world is reached through the
//! [`Host`] trait; [`SimulatedHost`] is a deterministic implementation with
//! a virtual clock.
//!
//! # Quick Start
//!
//! ```
//! use std::rc::Rc;
//! use std::time::Duration;
//! use vela_json::{Decoder, decode};
//! use vela_runtime::managers::time;
//! use vela_runtime::{Application, Cmd, Program, ProgramConfig, Registry, SimulatedHost, Sub};
//! use vela_vdom::{Html, MemoryDocument, html};
//!
//! struct Clock;
//!
//! impl Application for Clock {
//!     type Model = u64;
//!     type Msg = u64;
//!     type Flags = ();
//!
//!     fn flags_decoder(&self) -> Decoder<()> {
//!         decode::succeed(())
//!     }
//!     fn init(&self, _: ()) -> (u64, Cmd<u64>) {
//!         (0, Cmd::none())
//!     }
//!     fn update(&self, model: &mut u64, now: u64) -> Cmd<u64> {
//!         *model = now;
//!         Cmd::none()
//!     }
//!     fn view(&self, model: &u64) -> Html<u64> {
//!         html::text(model.to_string())
//!     }
//!     fn subscriptions(&self, _: &u64) -> Sub<u64> {
//!         time::every(Duration::from_secs(1), |t| t.millis())
//!     }
//! }
//!
//! let host = SimulatedHost::new();
//! let mut doc = MemoryDocument::new();
//! let body = doc.create_root("body");
//! let config = ProgramConfig::default();
//! let program = Program::start(
//!     Clock,
//!     &config,
//!     Registry::standard(&config),
//!     Rc::new(host.clone()),
//!     doc,
//!     body,
//! )
//! .unwrap();
//!
//! host.advance(Duration::from_secs(3));
//! assert_eq!(program.with_model(|m| *m).unwrap(), 3000);
//! ```

pub mod config;
pub mod effects;
pub mod error;
pub mod host;
pub mod logging;
pub mod managers;
pub mod program;
pub mod scheduler;
pub mod task;

pub use config::{ConfigError, ProgramConfig};
pub use effects::{Cmd, EffectManager, Message, Registry, Router, Sub, Tagger};
pub use error::RuntimeError;
pub use host::{
    EventTarget, Host, HostHandle, HttpFailure, HttpRequest, HttpResponse, Posix, SimulatedHost,
};
pub use managers::task::{attempt, perform};
pub use program::{Application, EventReport, Program};
pub use scheduler::{ProcessId, Scheduler, WeakScheduler, kill, send, spawn};
pub use task::{CancelError, CancelHook, Never, Resolver, Task, sequence, sleep};
