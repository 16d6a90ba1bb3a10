#![forbid(unsafe_code)]

//! Cooperative process scheduler.
//!
//! A process runs one [`Task`] to completion. The scheduler keeps a single
//! ready queue; enqueueing a process pushes it and, unless a drain
//! is already in progress, steps queued processes in FIFO order until the
//! queue is empty. Each step runs a process until it suspends on a binding
//! or an empty mailbox, or resolves.
//!
//! Stepping rules:
//!
//! - `Succeed`: pop continuation frames up to the next `and_then`; none left
//!   means the process is done.
//! - `Fail`: pop up to the next `on_error`; none left means the process is
//!   done (failed).
//! - `and_then`/`on_error`: push the frame and continue with the inner task.
//! - `Receive`: take the oldest mailbox message, or suspend.
//! - `Binding`: hand a one-shot resume handle to the host bridge, keep the
//!   returned cancellation hook, and suspend.
//!
//! # Invariants
//!
//! 1. Mailboxes are FIFO.
//! 2. A process spawned or resumed during a drain runs after the processes
//!    already queued.
//! 3. Killing a process suspended on a binding runs that binding's
//!    cancellation hook exactly once and removes the process from the queue.
//! 4. Resumes that arrive after a kill, or after the binding was already
//!    resumed, are ignored.
//! 5. No scheduler borrow is held while user code runs.
//!
//! # Failure Modes
//!
//! - Cancellation hook errors are logged at debug level and dropped.
//! - Messages sent to a dead process are dropped.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::host::Host;
use crate::task::{BindingFn, CancelHook, Continuation, Erased, RawTask, Task};

/// Identifier of a running process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<0.{}>", self.0)
    }
}

enum Frame {
    AndThen(Continuation),
    OnError(Continuation),
}

struct Process {
    root: Option<RawTask>,
    stack: Vec<Frame>,
    mailbox: VecDeque<Erased>,
    /// Token of the binding this process is suspended on.
    awaiting: Option<u64>,
    cancel: Option<CancelHook>,
}

impl Process {
    fn new(root: RawTask) -> Self {
        Self {
            root: Some(root),
            stack: Vec::new(),
            mailbox: VecDeque::new(),
            awaiting: None,
            cancel: None,
        }
    }
}

#[derive(Default)]
struct State {
    processes: AHashMap<ProcessId, Process>,
    queue: VecDeque<ProcessId>,
    working: bool,
    next_pid: u64,
    next_token: u64,
}

struct Inner {
    host: Rc<dyn Host>,
    state: RefCell<State>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Handle to a scheduler. Clones share the same processes.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Scheduler")
            .field("processes", &state.processes.len())
            .field("queued", &state.queue.len())
            .field("working", &state.working)
            .finish()
    }
}

/// Non-owning scheduler handle for host callbacks.
#[derive(Clone, Debug)]
pub struct WeakScheduler {
    inner: Weak<Inner>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

impl Scheduler {
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self {
            inner: Rc::new(Inner {
                host,
                state: RefCell::new(State::default()),
            }),
        }
    }

    /// The host this scheduler's bindings talk to.
    pub fn host(&self) -> &dyn Host {
        &*self.inner.host
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Start a process running `task`.
    pub fn raw_spawn<T: 'static, E: 'static>(&self, task: Task<T, E>) -> ProcessId {
        self.raw_spawn_with(|_| task.into_raw())
    }

    /// Start a process whose task needs to know its own id.
    pub(crate) fn raw_spawn_with(&self, build: impl FnOnce(ProcessId) -> RawTask) -> ProcessId {
        let pid = {
            let mut state = self.inner.state.borrow_mut();
            let pid = ProcessId(state.next_pid);
            state.next_pid += 1;
            pid
        };
        let root = build(pid);
        self.inner
            .state
            .borrow_mut()
            .processes
            .insert(pid, Process::new(root));
        tracing::debug!(pid = %pid, "spawned process");
        self.enqueue(pid);
        pid
    }

    /// Put `message` in the mailbox of `pid`.
    pub fn raw_send<M: Any>(&self, pid: ProcessId, message: M) {
        self.raw_send_erased(pid, Box::new(message));
    }

    pub(crate) fn raw_send_erased(&self, pid: ProcessId, message: Erased) {
        let delivered = {
            let mut state = self.inner.state.borrow_mut();
            match state.processes.get_mut(&pid) {
                Some(process) => {
                    process.mailbox.push_back(message);
                    true
                }
                None => false,
            }
        };
        if delivered {
            self.enqueue(pid);
        } else {
            tracing::trace!(pid = %pid, "dropped message for dead process");
        }
    }

    /// Stop `pid`. Runs the cancellation hook of a pending binding.
    pub fn raw_kill(&self, pid: ProcessId) {
        let process = {
            let mut state = self.inner.state.borrow_mut();
            let process = state.processes.remove(&pid);
            state.queue.retain(|queued| *queued != pid);
            process
        };
        let Some(mut process) = process else {
            return;
        };
        tracing::debug!(pid = %pid, "killed process");
        if let Some(cancel) = process.cancel.take() {
            if let Err(err) = cancel() {
                tracing::debug!(pid = %pid, error = %err, "cancellation hook failed");
            }
        }
    }

    /// Kill every process, oldest first.
    pub fn kill_all(&self) {
        let mut pids: Vec<ProcessId> = self.inner.state.borrow().processes.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            self.raw_kill(pid);
        }
    }

    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.inner.state.borrow().processes.contains_key(&pid)
    }

    pub fn is_queued(&self, pid: ProcessId) -> bool {
        self.inner.state.borrow().queue.contains(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.inner.state.borrow().processes.len()
    }

    /// Run `f` with draining deferred, then drain. Everything `f` enqueues
    /// is queued before any of it is stepped.
    pub fn hold<R>(&self, f: impl FnOnce() -> R) -> R {
        let nested = std::mem::replace(&mut self.inner.state.borrow_mut().working, true);
        let out = f();
        if !nested {
            self.drain();
        }
        out
    }

    pub(crate) fn enqueue(&self, pid: ProcessId) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.queue.push_back(pid);
            if state.working {
                return;
            }
            state.working = true;
        }
        self.drain();
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut state = self.inner.state.borrow_mut();
                match state.queue.pop_front() {
                    Some(pid) => pid,
                    None => {
                        state.working = false;
                        return;
                    }
                }
            };
            self.step(next);
        }
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    fn step(&self, pid: ProcessId) {
        tracing::trace!(pid = %pid, "step");
        loop {
            let task = {
                let mut state = self.inner.state.borrow_mut();
                let Some(process) = state.processes.get_mut(&pid) else {
                    return;
                };
                let Some(task) = process.root.take() else {
                    return;
                };
                task
            };
            let next = match task {
                RawTask::Succeed(value) => match self.pop_frame(pid, true) {
                    Some(next) => next(value),
                    None => {
                        self.resolve(pid, "succeeded");
                        return;
                    }
                },
                RawTask::Fail(error) => match self.pop_frame(pid, false) {
                    Some(recover) => recover(error),
                    None => {
                        self.resolve(pid, "failed");
                        return;
                    }
                },
                RawTask::AndThen(next, inner) => {
                    self.push_frame(pid, Frame::AndThen(next));
                    *inner
                }
                RawTask::OnError(recover, inner) => {
                    self.push_frame(pid, Frame::OnError(recover));
                    *inner
                }
                RawTask::Receive(next) => {
                    let message = {
                        let mut state = self.inner.state.borrow_mut();
                        let Some(process) = state.processes.get_mut(&pid) else {
                            return;
                        };
                        match process.mailbox.pop_front() {
                            Some(message) => message,
                            None => {
                                process.root = Some(RawTask::Receive(next));
                                tracing::trace!(pid = %pid, "suspended on receive");
                                return;
                            }
                        }
                    };
                    next(message)
                }
                RawTask::Binding(start) => {
                    self.bind(pid, start);
                    return;
                }
            };
            let mut state = self.inner.state.borrow_mut();
            match state.processes.get_mut(&pid) {
                Some(process) => process.root = Some(next),
                None => return,
            }
        }
    }

    fn push_frame(&self, pid: ProcessId, frame: Frame) {
        if let Some(process) = self.inner.state.borrow_mut().processes.get_mut(&pid) {
            process.stack.push(frame);
        }
    }

    fn pop_frame(&self, pid: ProcessId, success: bool) -> Option<Continuation> {
        let mut state = self.inner.state.borrow_mut();
        let process = state.processes.get_mut(&pid)?;
        while let Some(frame) = process.stack.pop() {
            match (frame, success) {
                (Frame::AndThen(next), true) | (Frame::OnError(next), false) => return Some(next),
                _ => {}
            }
        }
        None
    }

    fn resolve(&self, pid: ProcessId, outcome: &'static str) {
        let process = self.inner.state.borrow_mut().processes.remove(&pid);
        tracing::trace!(pid = %pid, outcome, "process resolved");
        drop(process);
    }

    fn bind(&self, pid: ProcessId, start: BindingFn) {
        let token = {
            let mut state = self.inner.state.borrow_mut();
            let token = state.next_token;
            state.next_token += 1;
            match state.processes.get_mut(&pid) {
                Some(process) => process.awaiting = Some(token),
                None => return,
            }
            token
        };
        tracing::trace!(pid = %pid, "suspended on binding");
        let resume = Resume {
            scheduler: Rc::downgrade(&self.inner),
            pid,
            token,
        };
        let hook = start(self, resume);
        let unused = {
            let mut state = self.inner.state.borrow_mut();
            match state.processes.get_mut(&pid) {
                Some(process) if process.awaiting == Some(token) => {
                    process.cancel = hook;
                    None
                }
                _ => hook,
            }
        };
        drop(unused);
    }
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

/// One-shot handle that continues a process suspended on a binding.
pub(crate) struct Resume {
    scheduler: Weak<Inner>,
    pid: ProcessId,
    token: u64,
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume")
            .field("pid", &self.pid)
            .field("token", &self.token)
            .finish()
    }
}

impl Resume {
    pub(crate) fn resume(self, task: RawTask) {
        let Some(inner) = self.scheduler.upgrade() else {
            return;
        };
        let scheduler = Scheduler { inner };
        let unused_hook = {
            let mut state = scheduler.inner.state.borrow_mut();
            match state.processes.get_mut(&self.pid) {
                Some(process) if process.awaiting == Some(self.token) => {
                    process.awaiting = None;
                    process.root = Some(task);
                    process.cancel.take()
                }
                _ => {
                    tracing::trace!(pid = %self.pid, "ignored stale resume");
                    return;
                }
            }
        };
        drop(unused_hook);
        scheduler.enqueue(self.pid);
    }
}

// ---------------------------------------------------------------------------
// Process tasks
// ---------------------------------------------------------------------------

/// A task that starts a new process running `task`.
pub fn spawn<T: 'static, E: 'static>(task: Task<T, E>) -> Task<ProcessId> {
    Task::scheduled(move |scheduler, resolver| {
        resolver.succeed(scheduler.raw_spawn(task));
        None
    })
}

/// A task that puts `message` in the mailbox of `pid`.
pub fn send<M: 'static>(pid: ProcessId, message: M) -> Task<()> {
    Task::scheduled(move |scheduler, resolver| {
        scheduler.raw_send(pid, message);
        resolver.succeed(());
        None
    })
}

/// A task that kills `pid`. Killing a finished process does nothing.
pub fn kill(pid: ProcessId) -> Task<()> {
    Task::scheduled(move |scheduler, resolver| {
        scheduler.raw_kill(pid);
        resolver.succeed(());
        None
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;
    use crate::host::{HostHandle, SimulatedHost};
    use crate::task::{CancelError, Never, Resolver, receive, sequence, sleep};

    fn scheduler() -> (Scheduler, SimulatedHost) {
        let host = SimulatedHost::new();
        (Scheduler::new(Rc::new(host.clone())), host)
    }

    type Log = Rc<RefCell<Vec<String>>>;

    fn record(log: &Log, entry: impl Into<String>) -> Task<()> {
        let log = Rc::clone(log);
        let entry = entry.into();
        Task::binding(move |resolver: Resolver<(), _>| {
            log.borrow_mut().push(entry);
            resolver.succeed(());
            None
        })
    }

    /// Spawns a process that logs the next two `String`s it receives.
    fn receive_two(sched: &Scheduler, log: &Log) -> ProcessId {
        let sink = Rc::clone(log);
        sched.raw_spawn(receive(move |a: String| {
            let sink2 = Rc::clone(&sink);
            record(&sink, a).and_then(move |()| receive(move |b: String| record(&sink2, b)))
        }))
    }

    #[test]
    fn mailbox_is_fifo() {
        let (sched, _host) = scheduler();
        let log: Log = Rc::default();
        let pid = receive_two(&sched, &log);
        assert!(sched.is_alive(pid));
        sched.raw_send(pid, "m1".to_owned());
        sched.raw_send(pid, "m2".to_owned());
        assert_eq!(*log.borrow(), vec!["m1", "m2"]);
        assert!(!sched.is_alive(pid));
    }

    #[test]
    fn sends_from_queued_processes_arrive_in_spawn_order() {
        let (sched, _host) = scheduler();
        let log: Log = Rc::default();
        let pid = receive_two(&sched, &log);
        sched.hold(|| {
            let first = sched.raw_spawn(send(pid, "m1".to_owned()));
            let second = sched.raw_spawn(send(pid, "m2".to_owned()));
            assert!(sched.is_queued(first) && sched.is_queued(second));
        });
        assert_eq!(*log.borrow(), vec!["m1", "m2"]);
        assert!(!sched.is_alive(pid));
        assert_eq!(sched.process_count(), 0);
    }

    #[test]
    fn sends_from_spawned_children_arrive_in_spawn_order() {
        let (sched, _host) = scheduler();
        let log: Log = Rc::default();
        let pid = receive_two(&sched, &log);
        sched.raw_spawn(sequence(vec![
            spawn(send(pid, "m1".to_owned())),
            spawn(send(pid, "m2".to_owned())),
        ]));
        assert_eq!(*log.borrow(), vec!["m1", "m2"]);
        assert_eq!(sched.process_count(), 0);
    }

    #[test]
    fn messages_sent_before_receive_wait_in_the_mailbox() {
        let (sched, host) = scheduler();
        let log: Log = Rc::default();
        let sink = Rc::clone(&log);
        let pid = sched.raw_spawn(
            sleep(Duration::from_millis(5)).and_then(move |()| receive(move |m: String| record(&sink, m))),
        );
        sched.raw_send(pid, "early".to_owned());
        assert!(log.borrow().is_empty());
        host.advance(Duration::from_millis(5));
        assert_eq!(*log.borrow(), vec!["early"]);
    }

    #[test]
    fn kill_before_resolve_cancels_exactly_once() {
        let (sched, _host) = scheduler();
        let cancels = Rc::new(Cell::new(0));
        let pending: Rc<RefCell<Option<Resolver<(), ()>>>> = Rc::default();
        let (counter, slot) = (Rc::clone(&cancels), Rc::clone(&pending));
        let pid = sched.raw_spawn(Task::<(), ()>::binding(move |resolver| {
            *slot.borrow_mut() = Some(resolver);
            let hook = HostHandle::new(move || {
                counter.set(counter.get() + 1);
                Ok(())
            });
            Some(hook.into_hook())
        }));
        assert!(sched.is_alive(pid));

        sched.raw_kill(pid);
        assert_eq!(cancels.get(), 1);
        assert!(!sched.is_alive(pid));
        assert!(!sched.is_queued(pid));

        sched.raw_kill(pid);
        assert_eq!(cancels.get(), 1);

        let late = pending.borrow_mut().take().expect("binding ran");
        late.succeed(());
        assert!(!sched.is_alive(pid));
        assert_eq!(cancels.get(), 1);
    }

    #[test]
    fn kill_removes_queued_process() {
        let (sched, _host) = scheduler();
        let log: Log = Rc::default();
        let victim: Rc<Cell<Option<ProcessId>>> = Rc::default();
        let (sink, target) = (Rc::clone(&log), Rc::clone(&victim));
        sched.hold(|| {
            sched.raw_spawn(Task::<(), Never>::scheduled(move |s, resolver| {
                if let Some(pid) = target.get() {
                    s.raw_kill(pid);
                    assert!(!s.is_queued(pid));
                }
                resolver.succeed(());
                None
            }));
            let pid = sched.raw_spawn(record(&sink, "victim ran"));
            victim.set(Some(pid));
        });
        assert!(log.borrow().is_empty());
        assert_eq!(sched.process_count(), 0);
    }

    #[test]
    fn synchronous_resume_drops_hook() {
        let (sched, _host) = scheduler();
        let cancels = Rc::new(Cell::new(0));
        let result = Rc::new(Cell::new(0));
        let (counter, out) = (Rc::clone(&cancels), Rc::clone(&result));
        let pid = sched.raw_spawn(
            Task::<i32>::binding(move |resolver| {
                resolver.succeed(41);
                let hook = HostHandle::new(move || {
                    counter.set(counter.get() + 1);
                    Ok(())
                });
                Some(hook.into_hook())
            })
            .map(move |v| out.set(v + 1)),
        );
        assert_eq!(result.get(), 42);
        assert!(!sched.is_alive(pid));
        sched.raw_kill(pid);
        assert_eq!(cancels.get(), 0);
    }

    #[test]
    fn cancel_failures_are_swallowed() {
        let (sched, _host) = scheduler();
        let pid = sched.raw_spawn(Task::<(), Never>::binding(|_resolver| {
            Some(HostHandle::new(|| Err(CancelError("already gone".into()))).into_hook())
        }));
        sched.raw_kill(pid);
        assert!(!sched.is_alive(pid));
    }

    #[test]
    fn kill_all_cancels_pending_timers() {
        let (sched, host) = scheduler();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        sched.raw_spawn(sleep(Duration::from_millis(5)).map(move |()| flag.set(true)));
        sched.raw_spawn(sleep(Duration::from_millis(9)));
        assert_eq!(host.pending_timers(), 2);
        sched.kill_all();
        assert_eq!(sched.process_count(), 0);
        assert_eq!(host.pending_timers(), 0);
        host.advance(Duration::from_millis(10));
        assert!(!fired.get());
    }

    #[test]
    fn errors_skip_and_then_and_hit_on_error() {
        let (sched, _host) = scheduler();
        let out = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&out);
        let task = Task::<i32, String>::fail("boom".into())
            .and_then(|v| Task::succeed(v * 10))
            .map(|v| v.to_string())
            .on_error(|e| Task::<String, Never>::succeed(format!("recovered {e}")))
            .map(move |s| *sink.borrow_mut() = s);
        sched.raw_spawn(task);
        assert_eq!(*out.borrow(), "recovered boom");
    }

    #[test]
    fn success_skips_on_error() {
        let (sched, _host) = scheduler();
        let out = Rc::new(Cell::new(0));
        let sink = Rc::clone(&out);
        let task = Task::<i32, String>::succeed(2)
            .on_error(|_| Task::<i32, String>::succeed(-1))
            .map_err(|e: String| e.len())
            .and_then(|v| Task::succeed(v * 3))
            .result()
            .map(move |r| sink.set(r.unwrap_or(0)));
        sched.raw_spawn(task);
        assert_eq!(out.get(), 6);
    }

    #[test]
    fn sequence_collects_in_order() {
        let (sched, host) = scheduler();
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&out);
        let tasks = vec![
            sleep(Duration::from_millis(10)).map(|()| 1),
            Task::succeed(2),
            sleep(Duration::from_millis(1)).map(|()| 3),
        ];
        sched.raw_spawn(sequence(tasks).map(move |v| *sink.borrow_mut() = v));
        host.advance(Duration::from_millis(10));
        assert!(out.borrow().is_empty());
        host.advance(Duration::from_millis(1));
        assert_eq!(*out.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn spawned_processes_run_after_the_current_one() {
        let (sched, _host) = scheduler();
        let log: Log = Rc::default();
        let (a, b) = (Rc::clone(&log), Rc::clone(&log));
        let parent = record(&a, "parent start")
            .and_then(move |()| spawn(record(&b, "child")))
            .and_then(move |_| record(&a, "parent end"));
        sched.raw_spawn(parent);
        assert_eq!(*log.borrow(), vec!["parent start", "child", "parent end"]);
    }

    #[test]
    fn send_and_kill_tasks() {
        let (sched, _host) = scheduler();
        let log: Log = Rc::default();
        let sink = Rc::clone(&log);
        let listener = sched.raw_spawn(receive(move |m: &'static str| record(&sink, m)));
        sched.raw_spawn(send(listener, "hello").and_then(move |()| kill(listener)));
        assert_eq!(*log.borrow(), vec!["hello"]);
        assert!(!sched.is_alive(listener));
    }

    #[test]
    fn long_chains_do_not_grow_the_stack() {
        let (sched, _host) = scheduler();
        let out = Rc::new(Cell::new(0));
        let sink = Rc::clone(&out);
        let mut task: Task<u64> = Task::succeed(0);
        for _ in 0..10_000 {
            task = task.map(|n| n + 1);
        }
        sched.raw_spawn(task.map(move |n| sink.set(n)));
        assert_eq!(out.get(), 10_000);
    }
}
