#![forbid(unsafe_code)]

//! Document- and window-level event subscriptions.
//!
//! One host listener is installed per `(target, event)` pair that at least
//! one subscription wants; it is removed once nobody does. Payloads that a
//! subscriber's decoder rejects are dropped for that subscriber.

use std::rc::Rc;

use ahash::AHashMap;
use serde_json::Value;
use vela_json::Decoder;

use crate::effects::{EffectManager, Message, Router, Sub, Tagger};
use crate::host::EventTarget;
use crate::scheduler::{ProcessId, kill, spawn};
use crate::task::{Never, Resolver, Task, sequence};

pub const HOME: &str = "Events";

type Key = (EventTarget, String);
type Decode = Rc<dyn Fn(&Value) -> Option<Message>>;

/// Receive `decoder`'s output for every `event` fired on `target`.
pub fn on<Msg: 'static>(target: EventTarget, event: &str, decoder: Decoder<Msg>) -> Sub<Msg> {
    let event_name = event.to_owned();
    Sub::leaf(
        HOME,
        Listen {
            target,
            event: event.to_owned(),
            decode: Rc::new(move |payload: &Value| match decoder.run(payload) {
                Ok(msg) => Some(Box::new(msg) as Message),
                Err(err) => {
                    tracing::trace!(event = %event_name, error = %err, "dropped undecodable host event");
                    None
                }
            }),
        },
    )
}

/// Subscription payload of [`on`].
pub struct Listen {
    target: EventTarget,
    event: String,
    decode: Decode,
}

impl std::fmt::Debug for Listen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listen")
            .field("target", &self.target)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// A host event routed back to the manager.
#[derive(Debug)]
pub struct HostEvent {
    key: Key,
    payload: Value,
}

#[derive(Default)]
pub struct EventsState {
    subscribers: AHashMap<Key, Vec<Decode>>,
    listeners: AHashMap<Key, ProcessId>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EventsManager;

impl EffectManager for EventsManager {
    type State = EventsState;
    type Command = Never;
    type Subscription = Listen;
    type SelfMsg = HostEvent;

    fn home(&self) -> &str {
        HOME
    }

    fn init(&self) -> Task<EventsState> {
        Task::succeed(EventsState::default())
    }

    fn on_effects(
        &self,
        router: &Router<HostEvent>,
        _commands: Vec<Never>,
        subscriptions: Vec<Listen>,
        state: EventsState,
    ) -> Task<EventsState> {
        let mut subscribers: AHashMap<Key, Vec<Decode>> = AHashMap::new();
        let mut order: Vec<Key> = Vec::new();
        for sub in subscriptions {
            let key = (sub.target, sub.event);
            let entry = subscribers.entry(key.clone()).or_default();
            if entry.is_empty() {
                order.push(key);
            }
            entry.push(sub.decode);
        }

        let mut listeners = state.listeners;
        let stale: Vec<Key> = listeners
            .keys()
            .filter(|key| !subscribers.contains_key(*key))
            .cloned()
            .collect();
        let kills = stale
            .iter()
            .filter_map(|key| listeners.remove(key))
            .map(kill)
            .collect();

        let spawns = order
            .into_iter()
            .filter(|key| !listeners.contains_key(key))
            .map(|key| spawn(listener(key.clone(), router.clone())).map(move |pid| (key, pid)))
            .collect();

        sequence(kills).and_then(move |_| {
            sequence(spawns).map(move |spawned| {
                listeners.extend(spawned);
                EventsState {
                    subscribers,
                    listeners,
                }
            })
        })
    }

    fn on_self_msg(
        &self,
        router: &Router<HostEvent>,
        event: HostEvent,
        state: EventsState,
    ) -> Task<EventsState> {
        let sends: Vec<Task<()>> = state
            .subscribers
            .get(&event.key)
            .map(|decoders| {
                decoders
                    .iter()
                    .filter_map(|decode| decode(&event.payload))
                    .map(|message| router.send_to_app(message))
                    .collect()
            })
            .unwrap_or_default();
        sequence(sends).map(move |_| state)
    }

    fn map_command(&self, _tagger: &Tagger, command: Never) -> Never {
        match command {}
    }

    fn map_subscription(&self, tagger: &Tagger, sub: Listen) -> Listen {
        let outer = Rc::clone(tagger);
        let inner = sub.decode;
        Listen {
            decode: Rc::new(move |payload: &Value| inner(payload).map(|message| outer(message))),
            ..sub
        }
    }
}

/// A process that never finishes; each host event mails the manager.
fn listener(key: Key, router: Router<HostEvent>) -> Task<()> {
    Task::scheduled(move |scheduler, _resolver: Resolver<(), Never>| {
        let weak = scheduler.downgrade();
        let (target, event) = key.clone();
        let handler: Rc<dyn Fn(&Value)> = Rc::new(move |payload: &Value| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.raw_spawn(router.send_to_self(HostEvent {
                    key: key.clone(),
                    payload: payload.clone(),
                }));
            }
        });
        tracing::debug!(on = target.as_str(), event = %event, "installing host listener");
        let handle = scheduler.host().listen(target, &event, handler);
        Some(handle.into_hook())
    })
}
