#![forbid(unsafe_code)]

//! Commands, subscriptions and the effect manager registry.
//!
//! An application describes side effects as bags: [`Cmd`] for one-off
//! commands and [`Sub`] for standing subscriptions. A bag is a tree of
//! leaves addressed to a manager by its *home* name, batches, and message
//! taggers. After every state change the runtime flattens both bags,
//! partitions the leaves by home and sends each registered manager its
//! share. Every manager gets a share on every dispatch, even an empty one,
//! so a manager can tear down subscriptions that disappeared.
//!
//! A manager is a long-lived process looping over two kinds of mail: the
//! effects of the latest state, and messages it sent itself (timer ticks,
//! host events). See [`EffectManager`].
//!
//! # Invariants
//!
//! 1. A manager only ever sees leaves addressed to its own home.
//! 2. Taggers apply innermost first, through the manager's own
//!    `map_command`/`map_subscription`, once per leaf.
//! 3. All managers receive a dispatch before any of them is stepped.
//! 4. A dispatch requested while another is being delivered runs after it.
//!
//! # Failure Modes
//!
//! - A leaf for a home with no registered manager aborts the dispatch with
//!   [`RuntimeError::UnknownManager`].
//! - Registering two managers under one home fails with
//!   [`RuntimeError::DuplicateManager`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::error::RuntimeError;
use crate::scheduler::{ProcessId, Scheduler, send};
use crate::task::{Erased, Task, receive};

pub use vela_vdom::Message;

/// A message transformation installed by [`Cmd::map`] or [`Sub::map`].
pub type Tagger = Rc<dyn Fn(Message) -> Message>;

pub(crate) type AppSender = Rc<dyn Fn(Message)>;

/// Taggers enclosing the leaf being gathered, outermost first.
type TaggerChain = SmallVec<[Tagger; 4]>;

pub(crate) enum RawBag {
    Leaf { home: String, payload: Erased },
    Batch(Vec<RawBag>),
    Map(Tagger, Box<RawBag>),
}

fn tagger_for<A: 'static, B: 'static>(f: impl Fn(A) -> B + 'static) -> Tagger {
    Rc::new(move |message: Message| match message.downcast::<A>() {
        Ok(message) => Box::new(f(*message)) as Message,
        Err(other) => other,
    })
}

macro_rules! effect_bag {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<Msg> {
            bag: RawBag,
            _msg: PhantomData<fn() -> Msg>,
        }

        impl<Msg> fmt::Debug for $name<Msg> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }

        impl<Msg> Default for $name<Msg> {
            fn default() -> Self {
                Self::none()
            }
        }

        impl<Msg> $name<Msg> {
            fn wrap(bag: RawBag) -> Self {
                Self {
                    bag,
                    _msg: PhantomData,
                }
            }

            /// Nothing to do.
            pub fn none() -> Self {
                Self::wrap(RawBag::Batch(Vec::new()))
            }

            pub fn batch(items: Vec<Self>) -> Self {
                Self::wrap(RawBag::Batch(items.into_iter().map(|item| item.bag).collect()))
            }

            /// A single effect for the manager registered under `home`.
            pub fn leaf(home: &str, payload: impl Any) -> Self {
                Self::wrap(RawBag::Leaf {
                    home: home.to_owned(),
                    payload: Box::new(payload),
                })
            }

            pub(crate) fn into_raw(self) -> RawBag {
                self.bag
            }
        }

        impl<Msg: 'static> $name<Msg> {
            /// Transform every message this bag produces.
            pub fn map<B: 'static>(self, f: impl Fn(Msg) -> B + 'static) -> $name<B> {
                $name::wrap(RawBag::Map(tagger_for(f), Box::new(self.bag)))
            }
        }
    };
}

effect_bag! {
    /// One-off effects to run after an update.
    Cmd
}

effect_bag! {
    /// Standing interest in external events, recomputed after every update.
    Sub
}

// ---------------------------------------------------------------------------
// Managers
// ---------------------------------------------------------------------------

pub(crate) enum ManagerMsg {
    Effects {
        commands: Vec<Erased>,
        subscriptions: Vec<Erased>,
    },
    SelfMsg(Erased),
}

/// Lets a manager talk to the application and to itself.
pub struct Router<SelfMsg> {
    pid: ProcessId,
    app: AppSender,
    _msg: PhantomData<fn(SelfMsg)>,
}

impl<SelfMsg> Clone for Router<SelfMsg> {
    fn clone(&self) -> Self {
        Self {
            pid: self.pid,
            app: Rc::clone(&self.app),
            _msg: PhantomData,
        }
    }
}

impl<SelfMsg> fmt::Debug for Router<SelfMsg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("pid", &self.pid).finish()
    }
}

impl<SelfMsg: 'static> Router<SelfMsg> {
    pub(crate) fn new(pid: ProcessId, app: AppSender) -> Self {
        Self {
            pid,
            app,
            _msg: PhantomData,
        }
    }

    /// The manager's own process.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Deliver `message` to the application's update.
    pub fn send_to_app(&self, message: Message) -> Task<()> {
        let app = Rc::clone(&self.app);
        Task::binding(move |resolver| {
            app(message);
            resolver.succeed(());
            None
        })
    }

    /// Queue `message` for this manager's `on_self_msg`.
    pub fn send_to_self(&self, message: SelfMsg) -> Task<()> {
        send(self.pid, ManagerMsg::SelfMsg(Box::new(message)))
    }
}

/// A long-lived process owning one kind of effect.
pub trait EffectManager: 'static {
    type State: 'static;
    type Command: 'static;
    type Subscription: 'static;
    type SelfMsg: 'static;

    /// Name that effect leaves use to address this manager.
    fn home(&self) -> &str;

    fn init(&self) -> Task<Self::State>;

    /// Handle the full set of commands and subscriptions of the latest
    /// state.
    fn on_effects(
        &self,
        router: &Router<Self::SelfMsg>,
        commands: Vec<Self::Command>,
        subscriptions: Vec<Self::Subscription>,
        state: Self::State,
    ) -> Task<Self::State>;

    fn on_self_msg(
        &self,
        router: &Router<Self::SelfMsg>,
        message: Self::SelfMsg,
        state: Self::State,
    ) -> Task<Self::State>;

    /// Apply `tagger` to the messages `command` will produce.
    fn map_command(&self, tagger: &Tagger, command: Self::Command) -> Self::Command;

    /// Apply `tagger` to the messages `subscription` will produce.
    fn map_subscription(
        &self,
        tagger: &Tagger,
        subscription: Self::Subscription,
    ) -> Self::Subscription;

    /// Whether the host may push JSON values to this manager by name.
    fn accepts_port_values(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeafKind {
    Command,
    Subscription,
}

trait ErasedManager {
    fn home(&self) -> &str;
    fn accepts_port_values(&self) -> bool;
    fn start(self: Rc<Self>, scheduler: &Scheduler, app: AppSender) -> ProcessId;
    fn map_leaf(&self, tagger: &Tagger, kind: LeafKind, payload: Erased) -> Erased;
}

impl<M: EffectManager> ErasedManager for M {
    fn home(&self) -> &str {
        EffectManager::home(self)
    }

    fn accepts_port_values(&self) -> bool {
        EffectManager::accepts_port_values(self)
    }

    fn start(self: Rc<Self>, scheduler: &Scheduler, app: AppSender) -> ProcessId {
        scheduler.raw_spawn_with(move |pid| {
            let router = Router::new(pid, app);
            self.init()
                .and_then(move |state| manager_loop(self, router, state))
                .into_raw()
        })
    }

    fn map_leaf(&self, tagger: &Tagger, kind: LeafKind, payload: Erased) -> Erased {
        match kind {
            LeafKind::Command => match payload.downcast::<M::Command>() {
                Ok(command) => Box::new(self.map_command(tagger, *command)) as Erased,
                Err(other) => other,
            },
            LeafKind::Subscription => match payload.downcast::<M::Subscription>() {
                Ok(sub) => Box::new(self.map_subscription(tagger, *sub)) as Erased,
                Err(other) => other,
            },
        }
    }
}

fn downcast_all<T: 'static>(items: Vec<Erased>, home: &str) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match item.downcast::<T>() {
            Ok(item) => Some(*item),
            Err(_) => {
                tracing::debug!(home, "dropped effect leaf of an unexpected type");
                None
            }
        })
        .collect()
}

fn manager_loop<M: EffectManager>(
    manager: Rc<M>,
    router: Router<M::SelfMsg>,
    state: M::State,
) -> Task<()> {
    receive(move |message: ManagerMsg| {
        let next = match message {
            ManagerMsg::Effects {
                commands,
                subscriptions,
            } => {
                let home = manager.home();
                let commands = downcast_all(commands, home);
                let subscriptions = downcast_all(subscriptions, home);
                manager.on_effects(&router, commands, subscriptions, state)
            }
            ManagerMsg::SelfMsg(message) => match message.downcast::<M::SelfMsg>() {
                Ok(message) => manager.on_self_msg(&router, *message, state),
                Err(_) => {
                    tracing::debug!(home = manager.home(), "dropped self message of an unexpected type");
                    Task::succeed(state)
                }
            },
        };
        next.and_then(move |state| manager_loop(manager, router, state))
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The set of effect managers a program runs with.
#[derive(Default)]
pub struct Registry {
    managers: Vec<Rc<dyn ErasedManager>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.homes()).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `manager`. Managers receive effects in registration order.
    pub fn register<M: EffectManager>(&mut self, manager: M) -> Result<(), RuntimeError> {
        let home = EffectManager::home(&manager);
        if self.contains(home) {
            return Err(RuntimeError::DuplicateManager {
                home: home.to_owned(),
            });
        }
        self.managers.push(Rc::new(manager));
        Ok(())
    }

    /// Add a manager whose home is known to be free.
    pub(crate) fn insert<M: EffectManager>(&mut self, manager: M) {
        debug_assert!(!self.contains(EffectManager::home(&manager)));
        self.managers.push(Rc::new(manager));
    }

    /// Builder form of [`Registry::register`].
    pub fn with<M: EffectManager>(mut self, manager: M) -> Result<Self, RuntimeError> {
        self.register(manager)?;
        Ok(self)
    }

    pub fn contains(&self, home: &str) -> bool {
        self.managers.iter().any(|m| m.home() == home)
    }

    pub fn homes(&self) -> impl Iterator<Item = &str> {
        self.managers.iter().map(|m| m.home())
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Spawn every manager and return the dispatcher that feeds them.
    pub(crate) fn start(self, scheduler: &Scheduler, app: &AppSender) -> Dispatcher {
        let mut index = AHashMap::with_capacity(self.managers.len());
        let running = self
            .managers
            .into_iter()
            .enumerate()
            .map(|(at, manager)| {
                index.insert(manager.home().to_owned(), at);
                let pid = Rc::clone(&manager).start(scheduler, Rc::clone(app));
                Running { manager, pid }
            })
            .collect();
        Dispatcher {
            running,
            index,
            pending: RefCell::new(VecDeque::new()),
            active: Cell::new(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Running {
    manager: Rc<dyn ErasedManager>,
    pid: ProcessId,
}

/// Partitions effect bags and mails each manager its share.
pub(crate) struct Dispatcher {
    running: Vec<Running>,
    index: AHashMap<String, usize>,
    pending: RefCell<VecDeque<(RawBag, RawBag)>>,
    active: Cell<bool>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("managers", &self.running.len())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}

impl Dispatcher {
    /// Deliver `commands` and `subscriptions` to every manager, after any
    /// dispatch already in progress.
    pub(crate) fn dispatch(
        &self,
        scheduler: &Scheduler,
        commands: RawBag,
        subscriptions: RawBag,
    ) -> Result<(), RuntimeError> {
        self.pending
            .borrow_mut()
            .push_back((commands, subscriptions));
        if self.active.replace(true) {
            return Ok(());
        }
        let result = loop {
            let Some((commands, subscriptions)) = self.pending.borrow_mut().pop_front() else {
                break Ok(());
            };
            if let Err(err) = self.dispatch_now(scheduler, commands, subscriptions) {
                self.pending.borrow_mut().clear();
                break Err(err);
            }
        };
        self.active.set(false);
        result
    }

    fn dispatch_now(
        &self,
        scheduler: &Scheduler,
        commands: RawBag,
        subscriptions: RawBag,
    ) -> Result<(), RuntimeError> {
        let mut command_parts: Vec<Vec<Erased>> = self.running.iter().map(|_| Vec::new()).collect();
        let mut sub_parts: Vec<Vec<Erased>> = self.running.iter().map(|_| Vec::new()).collect();
        let mut taggers = TaggerChain::new();
        self.gather(commands, LeafKind::Command, &mut taggers, &mut command_parts)?;
        self.gather(subscriptions, LeafKind::Subscription, &mut taggers, &mut sub_parts)?;

        scheduler.hold(|| {
            let parts = command_parts.into_iter().zip(sub_parts);
            for (running, (commands, subscriptions)) in self.running.iter().zip(parts) {
                tracing::trace!(
                    home = running.manager.home(),
                    commands = commands.len(),
                    subscriptions = subscriptions.len(),
                    "dispatch effects"
                );
                scheduler.raw_send(
                    running.pid,
                    ManagerMsg::Effects {
                        commands,
                        subscriptions,
                    },
                );
            }
        });
        Ok(())
    }

    fn gather(
        &self,
        bag: RawBag,
        kind: LeafKind,
        taggers: &mut TaggerChain,
        out: &mut [Vec<Erased>],
    ) -> Result<(), RuntimeError> {
        match bag {
            RawBag::Leaf { home, payload } => {
                let Some(&at) = self.index.get(&home) else {
                    return Err(RuntimeError::UnknownManager { home });
                };
                let payload = match compose(taggers) {
                    Some(tagger) => self.running[at].manager.map_leaf(&tagger, kind, payload),
                    None => payload,
                };
                out[at].push(payload);
                Ok(())
            }
            RawBag::Batch(bags) => bags
                .into_iter()
                .try_for_each(|bag| self.gather(bag, kind, taggers, out)),
            RawBag::Map(tagger, inner) => {
                taggers.push(tagger);
                let result = self.gather(*inner, kind, taggers, out);
                taggers.pop();
                result
            }
        }
    }

    /// Process of the incoming port named `name`.
    pub(crate) fn port(&self, name: &str) -> Option<ProcessId> {
        let &at = self.index.get(name)?;
        let running = &self.running[at];
        running.manager.accepts_port_values().then_some(running.pid)
    }

    pub(crate) fn pids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.running.iter().map(|r| r.pid)
    }
}

/// Fold a tagger stack (outermost first) into one function applying the
/// innermost tagger first.
fn compose(taggers: &[Tagger]) -> Option<Tagger> {
    match taggers {
        [] => None,
        [only] => Some(Rc::clone(only)),
        _ => {
            let chain = taggers.to_vec();
            Some(Rc::new(move |message: Message| {
                chain.iter().rev().fold(message, |message, tagger| tagger(message))
            }))
        }
    }
}
