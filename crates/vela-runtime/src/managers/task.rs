#![forbid(unsafe_code)]

//! Running tasks as commands.
//!
//! [`perform`] and [`attempt`] wrap a task in a command. The manager runs
//! each one in its own process and hands the resulting message to the
//! application.

use std::rc::Rc;

use crate::effects::{Cmd, EffectManager, Message, Router, Tagger};
use crate::scheduler::spawn;
use crate::task::{Never, Task, sequence};

pub const HOME: &str = "Task";

/// A task producing an application message.
pub struct Perform(Task<Message>);

impl std::fmt::Debug for Perform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Perform").field(&self.0).finish()
    }
}

/// Run `task` and send `to_msg` of its result to the application.
pub fn perform<T: 'static, Msg: 'static>(
    task: Task<T, Never>,
    to_msg: impl FnOnce(T) -> Msg + 'static,
) -> Cmd<Msg> {
    Cmd::leaf(
        HOME,
        Perform(task.map(move |value| Box::new(to_msg(value)) as Message)),
    )
}

/// Run a task that may fail and send `to_msg` of the outcome.
pub fn attempt<T: 'static, E: 'static, Msg: 'static>(
    task: Task<T, E>,
    to_msg: impl FnOnce(Result<T, E>) -> Msg + 'static,
) -> Cmd<Msg> {
    Cmd::leaf(
        HOME,
        Perform(task.result().map(move |result| Box::new(to_msg(result)) as Message)),
    )
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TaskManager;

impl EffectManager for TaskManager {
    type State = ();
    type Command = Perform;
    type Subscription = Never;
    type SelfMsg = Never;

    fn home(&self) -> &str {
        HOME
    }

    fn init(&self) -> Task<()> {
        Task::succeed(())
    }

    fn on_effects(
        &self,
        router: &Router<Never>,
        commands: Vec<Perform>,
        _subscriptions: Vec<Never>,
        state: (),
    ) -> Task<()> {
        let spawns = commands
            .into_iter()
            .map(|Perform(task)| {
                let router = router.clone();
                spawn(task.and_then(move |message| router.send_to_app(message)))
            })
            .collect();
        sequence(spawns).map(move |_| state)
    }

    fn on_self_msg(&self, _router: &Router<Never>, message: Never, _state: ()) -> Task<()> {
        match message {}
    }

    fn map_command(&self, tagger: &Tagger, Perform(task): Perform) -> Perform {
        let tagger = Rc::clone(tagger);
        Perform(task.map(move |message| tagger(message)))
    }

    fn map_subscription(&self, _tagger: &Tagger, subscription: Never) -> Never {
        match subscription {}
    }
}
