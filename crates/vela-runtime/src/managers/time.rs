#![forbid(unsafe_code)]

//! Clock reads and periodic ticks.
//!
//! Subscriptions with the same interval share one host interval; the
//! interval runs only while at least one subscription asks for it.
//!
//! # Invariants
//!
//! 1. After every dispatch there is exactly one interval process per
//!    distinct interval among the current subscriptions.
//! 2. A tick delivers one message per subscriber, in subscription order,
//!    all stamped with the same time.

use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;

use crate::effects::{EffectManager, Message, Router, Sub, Tagger};
use crate::host::{Posix, duration_millis};
use crate::scheduler::{ProcessId, kill, spawn};
use crate::task::{Never, Resolver, Task, sequence};

pub const HOME: &str = "Time";

type TickTagger = Rc<dyn Fn(Posix) -> Message>;

/// The host's current time.
pub fn now() -> Task<Posix> {
    Task::scheduled(|scheduler, resolver| {
        resolver.succeed(scheduler.host().now());
        None
    })
}

/// Receive `to_msg(now)` every `interval`.
pub fn every<Msg: 'static>(interval: Duration, to_msg: impl Fn(Posix) -> Msg + 'static) -> Sub<Msg> {
    Sub::leaf(
        HOME,
        Every {
            interval_ms: duration_millis(interval).max(1),
            tagger: Rc::new(move |time| Box::new(to_msg(time)) as Message),
        },
    )
}

/// Subscription payload of [`every`].
pub struct Every {
    interval_ms: u64,
    tagger: TickTagger,
}

impl std::fmt::Debug for Every {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Every")
            .field("interval_ms", &self.interval_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct TimeState {
    taggers: AHashMap<u64, Vec<TickTagger>>,
    processes: AHashMap<u64, ProcessId>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TimeManager;

impl EffectManager for TimeManager {
    type State = TimeState;
    type Command = Never;
    type Subscription = Every;
    type SelfMsg = u64;

    fn home(&self) -> &str {
        HOME
    }

    fn init(&self) -> Task<TimeState> {
        Task::succeed(TimeState::default())
    }

    fn on_effects(
        &self,
        router: &Router<u64>,
        _commands: Vec<Never>,
        subscriptions: Vec<Every>,
        state: TimeState,
    ) -> Task<TimeState> {
        let mut taggers: AHashMap<u64, Vec<TickTagger>> = AHashMap::new();
        for sub in subscriptions {
            taggers.entry(sub.interval_ms).or_default().push(sub.tagger);
        }

        let mut processes = state.processes;
        let mut stale: Vec<u64> = processes
            .keys()
            .filter(|interval| !taggers.contains_key(*interval))
            .copied()
            .collect();
        stale.sort_unstable();
        let kills = stale
            .iter()
            .filter_map(|interval| processes.remove(interval))
            .map(kill)
            .collect();

        let mut fresh: Vec<u64> = taggers
            .keys()
            .filter(|interval| !processes.contains_key(*interval))
            .copied()
            .collect();
        fresh.sort_unstable();
        let spawns = fresh
            .into_iter()
            .map(|interval| {
                spawn(ticker(interval, router.clone())).map(move |pid| (interval, pid))
            })
            .collect();

        sequence(kills).and_then(move |_| {
            sequence(spawns).map(move |spawned| {
                processes.extend(spawned);
                TimeState {
                    taggers,
                    processes,
                }
            })
        })
    }

    fn on_self_msg(&self, router: &Router<u64>, interval: u64, state: TimeState) -> Task<TimeState> {
        let Some(taggers) = state.taggers.get(&interval).cloned() else {
            return Task::succeed(state);
        };
        let router = router.clone();
        now().and_then(move |time| {
            let sends = taggers
                .iter()
                .map(|tagger| router.send_to_app(tagger(time)))
                .collect();
            sequence(sends).map(move |_| state)
        })
    }

    fn map_command(&self, _tagger: &Tagger, command: Never) -> Never {
        match command {}
    }

    fn map_subscription(&self, tagger: &Tagger, sub: Every) -> Every {
        let outer = Rc::clone(tagger);
        let inner = sub.tagger;
        Every {
            interval_ms: sub.interval_ms,
            tagger: Rc::new(move |time| outer(inner(time))),
        }
    }
}

/// A process that never finishes; each host tick mails the manager.
fn ticker(interval: u64, router: Router<u64>) -> Task<()> {
    Task::scheduled(move |scheduler, _resolver: Resolver<(), Never>| {
        let weak = scheduler.downgrade();
        let tick: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.raw_spawn(router.send_to_self(interval));
            }
        });
        let handle = scheduler
            .host()
            .set_interval(Duration::from_millis(interval), tick);
        Some(handle.into_hook())
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::effects::{AppSender, Cmd, Dispatcher, Registry};
    use crate::host::SimulatedHost;
    use crate::scheduler::Scheduler;

    type Log = Rc<RefCell<Vec<String>>>;

    fn setup() -> (SimulatedHost, Scheduler, Dispatcher, Log) {
        let host = SimulatedHost::new();
        let scheduler = Scheduler::new(Rc::new(host.clone()));
        let log: Log = Rc::default();
        let sink = Rc::clone(&log);
        let app: AppSender = Rc::new(move |m: Message| {
            if let Ok(m) = m.downcast::<String>() {
                sink.borrow_mut().push(*m);
            }
        });
        let dispatcher = Registry::new()
            .with(TimeManager)
            .expect("one manager")
            .start(&scheduler, &app);
        (host, scheduler, dispatcher, log)
    }

    fn subscribe(scheduler: &Scheduler, dispatcher: &Dispatcher, sub: Sub<String>) {
        dispatcher
            .dispatch(scheduler, Cmd::<String>::none().into_raw(), sub.into_raw())
            .expect("dispatch");
    }

    #[test]
    fn now_reads_the_host_clock() {
        let host = SimulatedHost::starting_at(Posix::from_millis(1234));
        let scheduler = Scheduler::new(Rc::new(host));
        let seen = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&seen);
        scheduler.raw_spawn(now().map(move |t| *slot.borrow_mut() = Some(t)));
        assert_eq!(*seen.borrow(), Some(Posix::from_millis(1234)));
    }

    #[test]
    fn ticks_until_unsubscribed() {
        let (host, scheduler, dispatcher, log) = setup();
        subscribe(
            &scheduler,
            &dispatcher,
            every(Duration::from_millis(100), |t| format!("tick {}", t.millis())),
        );
        assert_eq!(host.pending_timers(), 1);
        host.advance(Duration::from_millis(250));
        assert_eq!(*log.borrow(), vec!["tick 100", "tick 200"]);

        subscribe(&scheduler, &dispatcher, Sub::none());
        assert_eq!(host.pending_timers(), 0);
        host.advance(Duration::from_millis(500));
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn same_interval_shares_one_timer() {
        let (host, scheduler, dispatcher, log) = setup();
        let sub = Sub::batch(vec![
            every(Duration::from_millis(50), |_| "a".to_owned()),
            every(Duration::from_millis(50), |_| "b".to_owned()),
            every(Duration::from_millis(75), |_| "c".to_owned()),
        ]);
        subscribe(&scheduler, &dispatcher, sub);
        assert_eq!(host.pending_timers(), 2);
        host.advance(Duration::from_millis(75));
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn resubscribing_keeps_the_running_timer() {
        let (host, scheduler, dispatcher, log) = setup();
        let make = || every(Duration::from_millis(100), |_| "tick".to_owned());
        subscribe(&scheduler, &dispatcher, make());
        host.advance(Duration::from_millis(60));
        subscribe(&scheduler, &dispatcher, make());
        host.advance(Duration::from_millis(40));
        assert_eq!(*log.borrow(), vec!["tick"]);
        assert_eq!(host.pending_timers(), 1);
    }

    #[test]
    fn mapped_ticks_use_the_latest_tagger() {
        let (host, scheduler, dispatcher, log) = setup();
        let child = every(Duration::from_millis(10), |t| t.millis());
        subscribe(&scheduler, &dispatcher, child.map(|ms: u64| format!("{ms}ms")));
        host.advance(Duration::from_millis(10));
        let child = every(Duration::from_millis(10), |t| t.millis());
        subscribe(&scheduler, &dispatcher, child.map(|ms: u64| format!("at {ms}")));
        host.advance(Duration::from_millis(10));
        assert_eq!(*log.borrow(), vec!["10ms", "at 20"]);
    }
}
