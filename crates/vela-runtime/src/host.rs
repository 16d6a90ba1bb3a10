#![forbid(unsafe_code)]

//! The outgoing effect boundary.
//!
//! Everything the kernel asks of the outside world (clocks, timers, HTTP,
//! document-level event listeners, animation frames, outgoing ports) goes
//! through the [`Host`] trait. Each operation takes its payload and a
//! completion callback and returns a [`HostHandle`] that can undo it.
//!
//! [`SimulatedHost`] is a deterministic in-memory host: a virtual clock that
//! only moves when told to, scripted HTTP responses, and event injection.
//! It backs the test suites and headless runs.
//!
//! # Invariants
//!
//! 1. Host callbacks are never invoked while the host holds its own borrow,
//!    so a callback may call back into the host.
//! 2. [`SimulatedHost::advance`] fires timers in due order; timers due at
//!    the same instant fire in registration order.
//! 3. A cancelled operation never invokes its callback.
//!
//! # Failure Modes
//!
//! - Cancelling an operation that already completed returns
//!   [`CancelError`]; the scheduler logs and ignores it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use serde_json::Value;

use crate::config::ProgramConfig;
use crate::task::{CancelError, CancelHook};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Wall-clock time in milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Posix(u64);

impl Posix {
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    #[inline]
    pub const fn millis(self) -> u64 {
        self.0
    }

    /// The current system time.
    pub fn now() -> Self {
        let since_epoch = web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration_millis(since_epoch))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is later.
    pub fn since(self, earlier: Posix) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Undo handle for a host operation.
pub struct HostHandle {
    cancel: Option<CancelHook>,
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl HostHandle {
    pub fn new(cancel: impl FnOnce() -> Result<(), CancelError> + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle for an operation that cannot be undone.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(self) -> Result<(), CancelError> {
        match self.cancel {
            Some(cancel) => cancel(),
            None => Ok(()),
        }
    }

    pub fn into_hook(self) -> CancelHook {
        match self.cancel {
            Some(cancel) => cancel,
            None => Box::new(|| Ok(())),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Where a document-level listener is installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventTarget {
    Document,
    Window,
}

impl EventTarget {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Window => "window",
        }
    }
}

/// An HTTP request as handed to the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

/// An HTTP response of any status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    /// A `200 OK` response carrying `body`.
    pub fn ok(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::with_status(url, 200, body)
    }

    pub fn with_status(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            status_text: String::new(),
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

/// Transport-level HTTP failure reported by the host.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HttpFailure {
    #[error("malformed url `{0}`")]
    BadUrl(String),
    #[error("request timed out")]
    Timeout,
    #[error("network unreachable")]
    Network,
}

pub type HttpCallback = Box<dyn FnOnce(Result<HttpResponse, HttpFailure>)>;

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Services the runtime needs from its environment.
pub trait Host {
    fn now(&self) -> Posix;

    /// Call `done` once after `delay`.
    fn set_timeout(&self, delay: Duration, done: Box<dyn FnOnce()>) -> HostHandle;

    /// Call `tick` every `period` until cancelled.
    fn set_interval(&self, period: Duration, tick: Rc<dyn Fn()>) -> HostHandle;

    /// Call `done` with the frame time before the next repaint.
    fn request_animation_frame(&self, done: Box<dyn FnOnce(Posix)>) -> HostHandle;

    /// Start a request; cancelling aborts it without calling `done`.
    fn http_request(&self, request: HttpRequest, done: HttpCallback) -> HostHandle;

    /// Call `handler` with each `event` fired on `target`.
    fn listen(&self, target: EventTarget, event: &str, handler: Rc<dyn Fn(&Value)>) -> HostHandle;

    /// Deliver `value` to whatever the host attached to outgoing `port`.
    fn send_port(&self, port: &str, value: Value);
}

// ---------------------------------------------------------------------------
// SimulatedHost
// ---------------------------------------------------------------------------

enum Timer {
    Once(Box<dyn FnOnce()>),
    Every(Duration, Rc<dyn Fn()>),
}

struct PendingRequest {
    id: u64,
    request: HttpRequest,
    deadline: Option<u64>,
    done: HttpCallback,
}

struct Listener {
    id: u64,
    target: EventTarget,
    event: String,
    handler: Rc<dyn Fn(&Value)>,
}

type PortSubscriber = Rc<dyn Fn(&Value)>;

struct Sim {
    now: u64,
    frame_interval: Duration,
    next_id: u64,
    timers: BTreeMap<(u64, u64), Timer>,
    timer_due: AHashMap<u64, u64>,
    frames: Vec<(u64, Box<dyn FnOnce(Posix)>)>,
    pending: Vec<PendingRequest>,
    request_log: Vec<HttpRequest>,
    listeners: Vec<Listener>,
    port_log: AHashMap<String, Vec<Value>>,
    port_subscribers: AHashMap<String, Vec<PortSubscriber>>,
}

impl Sim {
    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn schedule(&mut self, id: u64, due: u64, timer: Timer) {
        self.timers.insert((due, id), timer);
        self.timer_due.insert(id, due);
    }

    fn cancel_timer(&mut self, id: u64) -> Result<(), CancelError> {
        let due = self
            .timer_due
            .remove(&id)
            .ok_or_else(|| CancelError(format!("timer {id} is no longer scheduled")))?;
        self.timers.remove(&(due, id));
        Ok(())
    }
}

enum Fire {
    Once(Box<dyn FnOnce()>),
    Every(Rc<dyn Fn()>),
    Timeout(HttpCallback),
}

/// Deterministic in-memory [`Host`].
///
/// Clones share state, so a test can keep one clone to drive time and
/// inspect effects while the program holds another.
#[derive(Clone)]
pub struct SimulatedHost {
    sim: Rc<RefCell<Sim>>,
}

impl fmt::Debug for SimulatedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sim = self.sim.borrow();
        f.debug_struct("SimulatedHost")
            .field("now", &sim.now)
            .field("timers", &sim.timers.len())
            .field("frames", &sim.frames.len())
            .field("pending_requests", &sim.pending.len())
            .field("listeners", &sim.listeners.len())
            .finish()
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Default frame interval of the simulated host.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

impl SimulatedHost {
    /// A host whose clock starts at the epoch.
    pub fn new() -> Self {
        Self::starting_at(Posix::from_millis(0))
    }

    /// A host whose clock starts at the current system time.
    pub fn starting_now() -> Self {
        Self::starting_at(Posix::now())
    }

    pub fn starting_at(start: Posix) -> Self {
        Self {
            sim: Rc::new(RefCell::new(Sim {
                now: start.millis(),
                frame_interval: DEFAULT_FRAME_INTERVAL,
                next_id: 0,
                timers: BTreeMap::new(),
                timer_due: AHashMap::new(),
                frames: Vec::new(),
                pending: Vec::new(),
                request_log: Vec::new(),
                listeners: Vec::new(),
                port_log: AHashMap::new(),
                port_subscribers: AHashMap::new(),
            })),
        }
    }

    /// A host pacing frames at the configured animation frame interval.
    pub fn from_config(config: &ProgramConfig) -> Self {
        Self::new().with_frame_interval(config.animation_frame)
    }

    /// Set the clock step used by [`SimulatedHost::advance_frame`].
    #[must_use]
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.sim.borrow_mut().frame_interval = interval.max(Duration::from_millis(1));
        self
    }

    fn weak(&self) -> Weak<RefCell<Sim>> {
        Rc::downgrade(&self.sim)
    }

    /// Move the clock forward, firing due timers and request timeouts.
    pub fn advance(&self, by: Duration) {
        let target = self.sim.borrow().now.saturating_add(duration_millis(by));
        while let Some(fire) = self.next_due(target) {
            match fire {
                Fire::Once(done) => done(),
                Fire::Every(tick) => tick(),
                Fire::Timeout(done) => done(Err(HttpFailure::Timeout)),
            }
        }
        let mut sim = self.sim.borrow_mut();
        sim.now = sim.now.max(target);
    }

    fn next_due(&self, target: u64) -> Option<Fire> {
        let mut sim = self.sim.borrow_mut();
        let timer = sim.timers.keys().next().copied().filter(|(due, _)| *due <= target);
        let timeout = sim
            .pending
            .iter()
            .filter_map(|r| r.deadline.map(|d| (d, r.id)))
            .filter(|(d, _)| *d <= target)
            .min();
        match (timer, timeout) {
            (Some((due, id)), t) if t.is_none_or(|(d, _)| due <= d) => {
                let timer = sim.timers.remove(&(due, id))?;
                sim.timer_due.remove(&id);
                sim.now = due;
                Some(match timer {
                    Timer::Once(done) => Fire::Once(done),
                    Timer::Every(period, tick) => {
                        let next = due.saturating_add(duration_millis(period));
                        sim.schedule(id, next, Timer::Every(period, Rc::clone(&tick)));
                        Fire::Every(tick)
                    }
                })
            }
            (_, Some((deadline, id))) => {
                let at = sim.pending.iter().position(|r| r.id == id)?;
                let request = sim.pending.remove(at);
                sim.now = deadline;
                Some(Fire::Timeout(request.done))
            }
            _ => None,
        }
    }

    /// Advance by one frame interval, then run every pending animation
    /// frame callback with the new time.
    pub fn advance_frame(&self) {
        let interval = self.sim.borrow().frame_interval;
        self.advance(interval);
        let (now, frames) = {
            let mut sim = self.sim.borrow_mut();
            (Posix::from_millis(sim.now), std::mem::take(&mut sim.frames))
        };
        for (_, done) in frames {
            done(now);
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.sim.borrow().timers.len()
    }

    pub fn pending_frames(&self) -> usize {
        self.sim.borrow().frames.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.sim.borrow().pending.len()
    }

    /// Every request started so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.sim.borrow().request_log.clone()
    }

    /// Complete the oldest pending request to `url`. Returns whether one was
    /// pending.
    pub fn respond(&self, url: &str, result: Result<HttpResponse, HttpFailure>) -> bool {
        let done = {
            let mut sim = self.sim.borrow_mut();
            let Some(at) = sim.pending.iter().position(|r| r.request.url == url) else {
                return false;
            };
            sim.pending.remove(at).done
        };
        done(result);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.sim.borrow().listeners.len()
    }

    /// Fire `event` on `target`. Returns how many listeners ran.
    pub fn emit(&self, target: EventTarget, event: &str, payload: &Value) -> usize {
        let handlers: Vec<_> = self
            .sim
            .borrow()
            .listeners
            .iter()
            .filter(|l| l.target == target && l.event == event)
            .map(|l| Rc::clone(&l.handler))
            .collect();
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// Values sent through outgoing `port` so far.
    pub fn port_messages(&self, port: &str) -> Vec<Value> {
        self.sim
            .borrow()
            .port_log
            .get(port)
            .cloned()
            .unwrap_or_default()
    }

    /// Call `subscriber` with every later value sent through `port`.
    pub fn subscribe_port(&self, port: &str, subscriber: impl Fn(&Value) + 'static) {
        self.sim
            .borrow_mut()
            .port_subscribers
            .entry(port.to_owned())
            .or_default()
            .push(Rc::new(subscriber));
    }
}

impl Host for SimulatedHost {
    fn now(&self) -> Posix {
        Posix::from_millis(self.sim.borrow().now)
    }

    fn set_timeout(&self, delay: Duration, done: Box<dyn FnOnce()>) -> HostHandle {
        let id = {
            let mut sim = self.sim.borrow_mut();
            let id = sim.fresh_id();
            let due = sim.now.saturating_add(duration_millis(delay));
            sim.schedule(id, due, Timer::Once(done));
            id
        };
        let weak = self.weak();
        HostHandle::new(move || match weak.upgrade() {
            Some(sim) => sim.borrow_mut().cancel_timer(id),
            None => Ok(()),
        })
    }

    fn set_interval(&self, period: Duration, tick: Rc<dyn Fn()>) -> HostHandle {
        let period = period.max(Duration::from_millis(1));
        let id = {
            let mut sim = self.sim.borrow_mut();
            let id = sim.fresh_id();
            let due = sim.now.saturating_add(duration_millis(period));
            sim.schedule(id, due, Timer::Every(period, tick));
            id
        };
        let weak = self.weak();
        HostHandle::new(move || match weak.upgrade() {
            Some(sim) => sim.borrow_mut().cancel_timer(id),
            None => Ok(()),
        })
    }

    fn request_animation_frame(&self, done: Box<dyn FnOnce(Posix)>) -> HostHandle {
        let id = {
            let mut sim = self.sim.borrow_mut();
            let id = sim.fresh_id();
            sim.frames.push((id, done));
            id
        };
        let weak = self.weak();
        HostHandle::new(move || {
            let Some(sim) = weak.upgrade() else {
                return Ok(());
            };
            let mut sim = sim.borrow_mut();
            let at = sim
                .frames
                .iter()
                .position(|(frame, _)| *frame == id)
                .ok_or_else(|| CancelError(format!("frame {id} already ran")))?;
            sim.frames.remove(at);
            Ok(())
        })
    }

    fn http_request(&self, request: HttpRequest, done: HttpCallback) -> HostHandle {
        let id = {
            let mut sim = self.sim.borrow_mut();
            let id = sim.fresh_id();
            let deadline = request
                .timeout
                .map(|t| sim.now.saturating_add(duration_millis(t)));
            sim.request_log.push(request.clone());
            sim.pending.push(PendingRequest {
                id,
                request,
                deadline,
                done,
            });
            id
        };
        let weak = self.weak();
        HostHandle::new(move || {
            let Some(sim) = weak.upgrade() else {
                return Ok(());
            };
            let mut sim = sim.borrow_mut();
            let at = sim
                .pending
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| CancelError(format!("request {id} already completed")))?;
            sim.pending.remove(at);
            Ok(())
        })
    }

    fn listen(&self, target: EventTarget, event: &str, handler: Rc<dyn Fn(&Value)>) -> HostHandle {
        let id = {
            let mut sim = self.sim.borrow_mut();
            let id = sim.fresh_id();
            sim.listeners.push(Listener {
                id,
                target,
                event: event.to_owned(),
                handler,
            });
            id
        };
        let weak = self.weak();
        HostHandle::new(move || {
            if let Some(sim) = weak.upgrade() {
                sim.borrow_mut().listeners.retain(|l| l.id != id);
            }
            Ok(())
        })
    }

    fn send_port(&self, port: &str, value: Value) {
        let subscribers = {
            let mut sim = self.sim.borrow_mut();
            sim.port_log
                .entry(port.to_owned())
                .or_default()
                .push(value.clone());
            sim.port_subscribers.get(port).cloned().unwrap_or_default()
        };
        for subscriber in subscribers {
            subscriber(&value);
        }
    }
}
