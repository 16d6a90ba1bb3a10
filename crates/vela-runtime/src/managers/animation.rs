#![forbid(unsafe_code)]

//! Animation frame subscriptions.
//!
//! While anyone subscribes, the manager keeps exactly one frame request
//! outstanding with the host. Each frame delivers the frame time, or the
//! time elapsed since the previous frame, to every subscriber, then asks for
//! the next frame.

use std::rc::Rc;
use std::time::Duration;

use crate::effects::{EffectManager, Message, Router, Sub, Tagger};
use crate::host::Posix;
use crate::managers::time::now;
use crate::scheduler::{ProcessId, kill, spawn};
use crate::task::{Never, Task, sequence};

pub const HOME: &str = "Animation";

/// Receive `to_msg(frame_time)` on every animation frame.
pub fn on_animation_frame<Msg: 'static>(to_msg: impl Fn(Posix) -> Msg + 'static) -> Sub<Msg> {
    Sub::leaf(
        HOME,
        Frames(Kind::Time(Rc::new(move |time| Box::new(to_msg(time)) as Message))),
    )
}

/// Receive `to_msg(elapsed)` on every animation frame, where `elapsed` is
/// the time since the previous frame.
pub fn on_animation_frame_delta<Msg: 'static>(
    to_msg: impl Fn(Duration) -> Msg + 'static,
) -> Sub<Msg> {
    Sub::leaf(
        HOME,
        Frames(Kind::Delta(Rc::new(move |delta| Box::new(to_msg(delta)) as Message))),
    )
}

/// Subscription payload of the animation manager.
pub struct Frames(Kind);

impl std::fmt::Debug for Frames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self.0 {
            Kind::Time(_) => "Frames(Time)",
            Kind::Delta(_) => "Frames(Delta)",
        })
    }
}

enum Kind {
    Time(Rc<dyn Fn(Posix) -> Message>),
    Delta(Rc<dyn Fn(Duration) -> Message>),
}

pub struct AnimationState {
    subscribers: Vec<Kind>,
    request: Option<ProcessId>,
    last_frame: Posix,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AnimationManager;

/// Wait for the next frame, then mail its time to the manager.
fn request_frame(router: Router<Posix>) -> Task<ProcessId> {
    let frame: Task<Posix> = Task::scheduled(|scheduler, resolver| {
        let handle = scheduler
            .host()
            .request_animation_frame(Box::new(move |time| resolver.succeed(time)));
        Some(handle.into_hook())
    });
    spawn(frame.and_then(move |time| router.send_to_self(time)))
}

impl EffectManager for AnimationManager {
    type State = AnimationState;
    type Command = Never;
    type Subscription = Frames;
    type SelfMsg = Posix;

    fn home(&self) -> &str {
        HOME
    }

    fn init(&self) -> Task<AnimationState> {
        now().map(|time| AnimationState {
            subscribers: Vec::new(),
            request: None,
            last_frame: time,
        })
    }

    fn on_effects(
        &self,
        router: &Router<Posix>,
        _commands: Vec<Never>,
        subscriptions: Vec<Frames>,
        state: AnimationState,
    ) -> Task<AnimationState> {
        let subscribers: Vec<Kind> = subscriptions.into_iter().map(|Frames(kind)| kind).collect();
        match (state.request, subscribers.is_empty()) {
            (None, true) => Task::succeed(AnimationState {
                subscribers,
                ..state
            }),
            (Some(pid), true) => kill(pid).map(move |()| AnimationState {
                subscribers,
                request: None,
                last_frame: state.last_frame,
            }),
            (Some(_), false) => Task::succeed(AnimationState {
                subscribers,
                ..state
            }),
            (None, false) => request_frame(router.clone()).and_then(move |pid| {
                now().map(move |time| AnimationState {
                    subscribers,
                    request: Some(pid),
                    last_frame: time,
                })
            }),
        }
    }

    fn on_self_msg(
        &self,
        router: &Router<Posix>,
        time: Posix,
        state: AnimationState,
    ) -> Task<AnimationState> {
        if state.subscribers.is_empty() {
            return Task::succeed(AnimationState {
                request: None,
                ..state
            });
        }
        let delta = time.since(state.last_frame);
        let sends: Vec<Task<()>> = state
            .subscribers
            .iter()
            .map(|kind| {
                router.send_to_app(match kind {
                    Kind::Time(f) => f(time),
                    Kind::Delta(f) => f(delta),
                })
            })
            .collect();
        request_frame(router.clone()).and_then(move |pid| {
            sequence(sends).map(move |_| AnimationState {
                subscribers: state.subscribers,
                request: Some(pid),
                last_frame: time,
            })
        })
    }

    fn map_command(&self, _tagger: &Tagger, command: Never) -> Never {
        match command {}
    }

    fn map_subscription(&self, tagger: &Tagger, Frames(kind): Frames) -> Frames {
        let outer = Rc::clone(tagger);
        Frames(match kind {
            Kind::Time(inner) => Kind::Time(Rc::new(move |time| outer(inner(time)))),
            Kind::Delta(inner) => Kind::Delta(Rc::new(move |delta| outer(inner(delta)))),
        })
    }
}
