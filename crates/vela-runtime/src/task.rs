#![forbid(unsafe_code)]

//! Tasks: descriptions of work for the scheduler to run.
//!
//! A [`Task<T, E>`] does nothing until a process runs it. It either
//! succeeds with a `T`, fails with an `E`, or suspends on a host callback
//! (a *binding*) and resumes later. Tasks compose with [`Task::and_then`]
//! and [`Task::on_error`]; the scheduler walks the resulting chain with an
//! explicit continuation stack, so long chains never grow the Rust stack.
//!
//! # Invariants
//!
//! 1. A binding's [`Resolver`] resumes its process at most once.
//! 2. A binding's cancellation hook runs only if the process is killed while
//!    the binding is still pending, and then exactly once.
//! 3. Success skips `on_error` continuations; failure skips `and_then`
//!    continuations.
//!
//! # Failure Modes
//!
//! - A continuation handed a value of an unexpected type turns the task into
//!   an internal failure that no typed `on_error` handler can observe; the
//!   process ends quietly. The typed API never produces this.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::scheduler::{Resume, Scheduler};

/// Error type of tasks that cannot fail.
pub type Never = Infallible;

pub(crate) type Erased = Box<dyn Any>;
pub(crate) type Continuation = Box<dyn FnOnce(Erased) -> RawTask>;
pub(crate) type BindingFn = Box<dyn FnOnce(&Scheduler, Resume) -> Option<CancelHook>>;

/// Undoes a pending host operation when its process is killed.
pub type CancelHook = Box<dyn FnOnce() -> Result<(), CancelError>>;

/// A cancellation hook could not undo its host operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cancellation failed: {0}")]
pub struct CancelError(pub String);

/// Untyped task tree as the scheduler sees it.
pub(crate) enum RawTask {
    Succeed(Erased),
    Fail(Erased),
    Binding(BindingFn),
    AndThen(Continuation, Box<RawTask>),
    OnError(Continuation, Box<RawTask>),
    Receive(Continuation),
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succeed(_) => "Succeed",
            Self::Fail(_) => "Fail",
            Self::Binding(_) => "Binding",
            Self::AndThen(..) => "AndThen",
            Self::OnError(..) => "OnError",
            Self::Receive(_) => "Receive",
        };
        f.write_str(name)
    }
}

/// Payload of the internal failure raised on a type mismatch.
#[derive(Debug)]
pub(crate) struct Mismatch(pub &'static str);

// ---------------------------------------------------------------------------
// Task<T, E>
// ---------------------------------------------------------------------------

/// Work that eventually produces a `T` or fails with an `E`.
pub struct Task<T, E = Never> {
    raw: RawTask,
    _types: PhantomData<fn() -> (T, E)>,
}

impl<T, E> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.raw).finish()
    }
}

impl<T: 'static, E: 'static> Task<T, E> {
    pub(crate) fn from_raw(raw: RawTask) -> Self {
        Self {
            raw,
            _types: PhantomData,
        }
    }

    pub(crate) fn into_raw(self) -> RawTask {
        self.raw
    }

    /// A task that immediately succeeds with `value`.
    pub fn succeed(value: T) -> Self {
        Self::from_raw(RawTask::Succeed(Box::new(value)))
    }

    /// A task that immediately fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::from_raw(RawTask::Fail(Box::new(error)))
    }

    /// Suspend on a host callback.
    ///
    /// `start` runs when a process reaches this task. It hands the
    /// [`Resolver`] to the host and may return a hook that undoes the host
    /// operation if the process is killed first. Resolving from inside
    /// `start` is allowed; the hook is then dropped unused.
    pub fn binding(start: impl FnOnce(Resolver<T, E>) -> Option<CancelHook> + 'static) -> Self {
        Self::scheduled(move |_, resolver| start(resolver))
    }

    /// Like [`Task::binding`], with access to the running scheduler and its
    /// host.
    pub fn scheduled(
        start: impl FnOnce(&Scheduler, Resolver<T, E>) -> Option<CancelHook> + 'static,
    ) -> Self {
        Self::from_raw(RawTask::Binding(Box::new(move |sched, resume| {
            start(sched, Resolver::new(resume))
        })))
    }

    /// Continue with `f` once this task succeeds.
    pub fn and_then<U: 'static>(self, f: impl FnOnce(T) -> Task<U, E> + 'static) -> Task<U, E> {
        let next: Continuation = Box::new(move |value| match value.downcast::<T>() {
            Ok(value) => f(*value).raw,
            Err(_) => RawTask::Fail(Box::new(Mismatch("and_then"))),
        });
        Task::from_raw(RawTask::AndThen(next, Box::new(self.raw)))
    }

    /// Transform the success value.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Task<U, E> {
        self.and_then(move |value| Task::succeed(f(value)))
    }

    /// Recover from a failure with `f`.
    pub fn on_error<F: 'static>(self, f: impl FnOnce(E) -> Task<T, F> + 'static) -> Task<T, F> {
        let recover: Continuation = Box::new(move |error| match error.downcast::<E>() {
            Ok(error) => f(*error).raw,
            Err(other) => RawTask::Fail(other),
        });
        Task::from_raw(RawTask::OnError(recover, Box::new(self.raw)))
    }

    /// Transform the failure value.
    pub fn map_err<F: 'static>(self, f: impl FnOnce(E) -> F + 'static) -> Task<T, F> {
        self.on_error(move |error| Task::fail(f(error)))
    }

    /// Turn a failure into a successful `Err`.
    pub fn result(self) -> Task<Result<T, E>, Never> {
        self.map(Ok).on_error(|error| Task::succeed(Err(error)))
    }
}

impl<T: 'static> Task<T, Never> {
    /// Widen the error type of an infallible task.
    pub fn never_fails<E: 'static>(self) -> Task<T, E> {
        Task::from_raw(self.raw)
    }
}

/// Run `tasks` one after another, collecting their values. Stops at the
/// first failure.
pub fn sequence<T: 'static, E: 'static>(tasks: Vec<Task<T, E>>) -> Task<Vec<T>, E> {
    let capacity = tasks.len();
    tasks
        .into_iter()
        .fold(Task::succeed(Vec::with_capacity(capacity)), |acc, task| {
            acc.and_then(move |mut values| {
                task.map(move |value| {
                    values.push(value);
                    values
                })
            })
        })
}

/// Wait for the next mailbox message of the running process.
pub(crate) fn receive<M: 'static, T: 'static, E: 'static>(
    f: impl FnOnce(M) -> Task<T, E> + 'static,
) -> Task<T, E> {
    Task::from_raw(RawTask::Receive(Box::new(move |message| {
        match message.downcast::<M>() {
            Ok(message) => f(*message).raw,
            Err(_) => RawTask::Fail(Box::new(Mismatch("receive"))),
        }
    })))
}

/// Succeed after `duration` of host time.
pub fn sleep(duration: Duration) -> Task<()> {
    Task::scheduled(move |sched, resolver| {
        let handle = sched
            .host()
            .set_timeout(duration, Box::new(move || resolver.succeed(())));
        Some(handle.into_hook())
    })
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// One-shot handle that resumes a suspended binding.
pub struct Resolver<T, E> {
    resume: Resume,
    _types: PhantomData<fn(T, E)>,
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").field("resume", &self.resume).finish()
    }
}

impl<T: 'static, E: 'static> Resolver<T, E> {
    fn new(resume: Resume) -> Self {
        Self {
            resume,
            _types: PhantomData,
        }
    }

    pub fn succeed(self, value: T) {
        self.resume.resume(RawTask::Succeed(Box::new(value)));
    }

    pub fn fail(self, error: E) {
        self.resume.resume(RawTask::Fail(Box::new(error)));
    }

    /// Continue the process with another task.
    pub fn resume(self, task: Task<T, E>) {
        self.resume.resume(task.raw);
    }
}
