#![forbid(unsafe_code)]

//! The runtime loop tying an application to its effects and its view.
//!
//! A [`Program`] owns the model, the mounted [`LiveTree`], the scheduler
//! and the running effect managers. Every message, from a DOM handler or
//! from a manager, goes through the same steps:
//!
//! 1. `update` the model, collecting its command;
//! 2. re-render: diff the previous view against the new one and patch the
//!    live tree;
//! 3. recompute subscriptions and dispatch commands and subscriptions to
//!    the managers.
//!
//! Rendering completes before the next message is handled, so a host event
//! always sees the live tree of the latest model.
//!
//! # Invariants
//!
//! 1. No borrow of program state is held while managers run; a manager may
//!    deliver further messages from inside a dispatch.
//! 2. After the first [`RuntimeError`] the program refuses all work and
//!    every entry point returns that error.
//!
//! # Failure Modes
//!
//! - Flags the decoder rejects fail [`Program::start`] with
//!   [`RuntimeError::InvalidFlags`].
//! - A DOM handler producing a message of another type halts the program
//!   with [`RuntimeError::HandlerTypeMismatch`].
//! - A message of the wrong type arriving from a manager is dropped and
//!   logged; it can only come from a hand-written manager.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;
use vela_json::Decoder;
use vela_vdom::{Document, Html, LiveTree, Node, NodeId};

use crate::config::ProgramConfig;
use crate::effects::{AppSender, Cmd, Dispatcher, ManagerMsg, Message, Registry, Sub};
use crate::error::RuntimeError;
use crate::host::Host;
use crate::scheduler::Scheduler;

/// An application in the model-update-view style.
pub trait Application: 'static {
    type Model: 'static;
    type Msg: 'static;
    type Flags: 'static;

    /// Decodes [`ProgramConfig::flags`] into [`Application::Flags`].
    fn flags_decoder(&self) -> Decoder<Self::Flags>;

    fn init(&self, flags: Self::Flags) -> (Self::Model, Cmd<Self::Msg>);

    fn update(&self, model: &mut Self::Model, msg: Self::Msg) -> Cmd<Self::Msg>;

    fn view(&self, model: &Self::Model) -> Html<Self::Msg>;

    fn subscriptions(&self, _model: &Self::Model) -> Sub<Self::Msg> {
        Sub::none()
    }
}

/// Outcome of [`Program::dispatch_event`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventReport {
    /// Messages the handlers produced, each already applied.
    pub messages: usize,
    pub stop_propagation: bool,
    pub prevent_default: bool,
}

struct Live<A: Application, D> {
    model: A::Model,
    view: Node,
    tree: LiveTree<D>,
    updates: u64,
}

struct Core<A: Application, D> {
    app: A,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    live: RefCell<Option<Live<A, D>>>,
    fatal: RefCell<Option<RuntimeError>>,
}

impl<A: Application, D: Document + 'static> Core<A, D> {
    fn check(&self) -> Result<(), RuntimeError> {
        match &*self.fatal.borrow() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record `err` if it is the first fatal error and hand back the one
    /// that stopped the program.
    fn halt(&self, err: RuntimeError) -> RuntimeError {
        let mut fatal = self.fatal.borrow_mut();
        match &*fatal {
            Some(first) => first.clone(),
            None => {
                tracing::error!(error = %err, "program halted");
                *fatal = Some(err.clone());
                err
            }
        }
    }

    /// Entry point for messages coming from effect managers.
    fn receive(&self, message: Message) {
        if self.fatal.borrow().is_some() {
            return;
        }
        match message.downcast::<A::Msg>() {
            Ok(msg) => {
                if let Err(err) = self.update(*msg) {
                    self.halt(err);
                }
            }
            Err(_) => tracing::debug!("dropped manager message of an unexpected type"),
        }
    }

    fn update(&self, msg: A::Msg) -> Result<(), RuntimeError> {
        self.check()?;
        let (cmd, subs) = {
            let mut live = self.live.borrow_mut();
            let live = live.as_mut().ok_or(RuntimeError::Stopped)?;
            let cmd = {
                let _span = tracing::debug_span!("vela.update", update = live.updates).entered();
                self.app.update(&mut live.model, msg)
            };
            live.updates += 1;
            self.render(live);
            (cmd, self.app.subscriptions(&live.model))
        };
        self.dispatch(cmd, subs)
    }

    fn render(&self, live: &mut Live<A, D>) {
        let _span = tracing::debug_span!("vela.render").entered();
        let started = web_time::Instant::now();
        let view = self.app.view(&live.model).into_node();
        let report = live.tree.patch(&live.view, &view);
        live.view = view;
        tracing::debug!(
            applied = report.applied,
            unbound = report.unbound,
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "rendered"
        );
    }

    fn dispatch(&self, cmd: Cmd<A::Msg>, subs: Sub<A::Msg>) -> Result<(), RuntimeError> {
        self.dispatcher
            .dispatch(&self.scheduler, cmd.into_raw(), subs.into_raw())
    }
}

/// A running application.
pub struct Program<A: Application, D: Document + 'static> {
    core: Rc<Core<A, D>>,
}

impl<A: Application, D: Document + 'static> fmt::Debug for Program<A, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("scheduler", &self.core.scheduler)
            .field("dispatcher", &self.core.dispatcher)
            .field("fatal", &*self.core.fatal.borrow())
            .finish_non_exhaustive()
    }
}

impl<A: Application, D: Document + 'static> Program<A, D> {
    /// Decode flags, mount the initial view into `container`, start the
    /// managers and run the initial command.
    pub fn start(
        app: A,
        config: &ProgramConfig,
        registry: Registry,
        host: Rc<dyn Host>,
        document: D,
        container: NodeId,
    ) -> Result<Self, RuntimeError> {
        let _span = tracing::debug_span!("vela.start", managers = registry.len()).entered();
        let flags = app.flags_decoder().run(&config.flags).map_err(|err| {
            tracing::error!(error = %err, "flags rejected");
            RuntimeError::InvalidFlags(err)
        })?;
        let (model, cmd) = app.init(flags);
        let view = app.view(&model).into_node();
        let tree = LiveTree::mount(document, container, &view).map_err(|err| {
            tracing::error!(error = %err, "mount failed");
            RuntimeError::from(err)
        })?;
        let subs = app.subscriptions(&model);
        let scheduler = Scheduler::new(host);

        let core = Rc::new_cyclic(|weak: &Weak<Core<A, D>>| {
            let weak = weak.clone();
            let sender: AppSender = Rc::new(move |message: Message| {
                if let Some(core) = weak.upgrade() {
                    core.receive(message);
                }
            });
            let dispatcher = registry.start(&scheduler, &sender);
            Core {
                app,
                scheduler,
                dispatcher,
                live: RefCell::new(Some(Live {
                    model,
                    view,
                    tree,
                    updates: 0,
                })),
                fatal: RefCell::new(None),
            }
        });
        if let Err(err) = core.dispatch(cmd, subs) {
            return Err(core.halt(err));
        }
        Ok(Self { core })
    }

    /// Apply `msg` as if a handler had produced it.
    pub fn send(&self, msg: A::Msg) -> Result<(), RuntimeError> {
        self.core
            .update(msg)
            .map_err(|err| self.core.halt(err))
    }

    /// Deliver a DOM event at `target` through the live tree's handlers and
    /// apply the resulting messages in bubbling order.
    pub fn dispatch_event(
        &self,
        target: NodeId,
        event: &str,
        payload: &Value,
    ) -> Result<EventReport, RuntimeError> {
        self.core.check()?;
        let dispatched = {
            let live = self.core.live.borrow();
            let live = live.as_ref().ok_or(RuntimeError::Stopped)?;
            live.tree.dispatch(target, event, payload)
        };
        let dispatched = dispatched.map_err(|err| self.core.halt(err.into()))?;
        let report = EventReport {
            messages: dispatched.messages.len(),
            stop_propagation: dispatched.stop_propagation,
            prevent_default: dispatched.prevent_default,
        };
        for message in dispatched.messages {
            let msg = message.downcast::<A::Msg>().map_err(|_| {
                self.core.halt(RuntimeError::HandlerTypeMismatch {
                    event: event.to_owned(),
                })
            })?;
            self.send(*msg)?;
        }
        Ok(report)
    }

    /// Push `value` into the incoming port named `port`.
    pub fn send_to_port(&self, port: &str, value: Value) -> Result<(), RuntimeError> {
        self.core.check()?;
        let pid = self
            .core
            .dispatcher
            .port(port)
            .ok_or_else(|| {
                self.core.halt(RuntimeError::UnknownPort {
                    name: port.to_owned(),
                })
            })?;
        self.core
            .scheduler
            .raw_send(pid, ManagerMsg::SelfMsg(Box::new(value)));
        self.core.check()
    }

    pub fn with_model<R>(&self, f: impl FnOnce(&A::Model) -> R) -> Result<R, RuntimeError> {
        let live = self.core.live.borrow();
        let live = live.as_ref().ok_or(RuntimeError::Stopped)?;
        Ok(f(&live.model))
    }

    /// Read the live document.
    pub fn with_document<R>(&self, f: impl FnOnce(&D) -> R) -> Result<R, RuntimeError> {
        let live = self.core.live.borrow();
        let live = live.as_ref().ok_or(RuntimeError::Stopped)?;
        Ok(f(live.tree.document()))
    }

    /// Live node the view's root is rendered into.
    pub fn root(&self) -> Result<NodeId, RuntimeError> {
        let live = self.core.live.borrow();
        let live = live.as_ref().ok_or(RuntimeError::Stopped)?;
        Ok(live.tree.root())
    }

    /// Number of updates applied so far.
    pub fn updates(&self) -> u64 {
        self.core
            .live
            .borrow()
            .as_ref()
            .map_or(0, |live| live.updates)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.core.scheduler
    }

    /// The error that halted the program, if any.
    pub fn error(&self) -> Option<RuntimeError> {
        self.core.fatal.borrow().clone()
    }

    /// Kill every process, cancelling pending host work, and drop the
    /// model and live tree.
    pub fn stop(&self) {
        self.core.halt(RuntimeError::Stopped);
        self.core.scheduler.kill_all();
        let live = self.core.live.borrow_mut().take();
        drop(live);
        tracing::debug!("program stopped");
    }
}
