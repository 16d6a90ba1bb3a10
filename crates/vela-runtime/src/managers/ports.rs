#![forbid(unsafe_code)]

//! Named JSON channels between the program and its host.
//!
//! An outgoing port is a manager whose commands are JSON values handed to
//! [`Host::send_port`](crate::host::Host::send_port). An incoming port is a
//! manager the host feeds through [`Program::send_to_port`]; each value is
//! decoded by every current subscriber.
//!
//! Each port is registered under its own name, so a program declares the
//! ports it uses when it builds its [`Registry`](crate::effects::Registry).
//!
//! [`Program::send_to_port`]: crate::program::Program::send_to_port

use std::rc::Rc;

use serde_json::Value;
use vela_json::Decoder;

use crate::effects::{Cmd, EffectManager, Message, Router, Sub, Tagger};
use crate::task::{Never, Task, sequence};

/// Send `value` out through the port named `port`.
pub fn send<Msg>(port: &str, value: Value) -> Cmd<Msg> {
    Cmd::leaf(port, PortValue(value))
}

/// Receive `decoder`'s output for every value the host pushes into `port`.
pub fn subscribe<Msg: 'static>(port: &str, decoder: Decoder<Msg>) -> Sub<Msg> {
    let name = port.to_owned();
    Sub::leaf(
        port,
        PortSub(Rc::new(move |value: &Value| match decoder.run(value) {
            Ok(msg) => Some(Box::new(msg) as Message),
            Err(err) => {
                tracing::debug!(port = %name, error = %err, "dropped undecodable port value");
                None
            }
        })),
    )
}

/// Command payload of an outgoing port.
#[derive(Clone, Debug, PartialEq)]
pub struct PortValue(Value);

/// Subscription payload of an incoming port.
pub struct PortSub(Rc<dyn Fn(&Value) -> Option<Message>>);

impl std::fmt::Debug for PortSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PortSub(..)")
    }
}

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct OutgoingPort {
    name: String,
}

impl OutgoingPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EffectManager for OutgoingPort {
    type State = ();
    type Command = PortValue;
    type Subscription = Never;
    type SelfMsg = Never;

    fn home(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Task<()> {
        Task::succeed(())
    }

    fn on_effects(
        &self,
        _router: &Router<Never>,
        commands: Vec<PortValue>,
        _subscriptions: Vec<Never>,
        state: (),
    ) -> Task<()> {
        if commands.is_empty() {
            return Task::succeed(state);
        }
        let name = self.name.clone();
        Task::scheduled(move |scheduler, resolver| {
            for PortValue(value) in commands {
                scheduler.host().send_port(&name, value);
            }
            resolver.succeed(state);
            None
        })
    }

    fn on_self_msg(&self, _router: &Router<Never>, message: Never, _state: ()) -> Task<()> {
        match message {}
    }

    fn map_command(&self, _tagger: &Tagger, command: PortValue) -> PortValue {
        command
    }

    fn map_subscription(&self, _tagger: &Tagger, subscription: Never) -> Never {
        match subscription {}
    }
}

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct IncomingPort {
    name: String,
}

impl IncomingPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EffectManager for IncomingPort {
    type State = Vec<PortSub>;
    type Command = Never;
    type Subscription = PortSub;
    type SelfMsg = Value;

    fn home(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Task<Vec<PortSub>> {
        Task::succeed(Vec::new())
    }

    fn on_effects(
        &self,
        _router: &Router<Value>,
        _commands: Vec<Never>,
        subscriptions: Vec<PortSub>,
        _state: Vec<PortSub>,
    ) -> Task<Vec<PortSub>> {
        Task::succeed(subscriptions)
    }

    fn on_self_msg(
        &self,
        router: &Router<Value>,
        value: Value,
        subscribers: Vec<PortSub>,
    ) -> Task<Vec<PortSub>> {
        if subscribers.is_empty() {
            tracing::debug!(port = %self.name, "port value arrived with no subscribers");
        }
        let sends: Vec<Task<()>> = subscribers
            .iter()
            .filter_map(|PortSub(decode)| decode(&value))
            .map(|message| router.send_to_app(message))
            .collect();
        sequence(sends).map(move |_| subscribers)
    }

    fn map_command(&self, _tagger: &Tagger, command: Never) -> Never {
        match command {}
    }

    fn map_subscription(&self, tagger: &Tagger, PortSub(inner): PortSub) -> PortSub {
        let outer = Rc::clone(tagger);
        PortSub(Rc::new(move |value: &Value| inner(value).map(|message| outer(message))))
    }

    fn accepts_port_values(&self) -> bool {
        true
    }
}
