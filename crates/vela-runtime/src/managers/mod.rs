#![forbid(unsafe_code)]

//! Built-in effect managers.
//!
//! | Home        | Commands               | Subscriptions                  |
//! |-------------|------------------------|--------------------------------|
//! | `Task`      | [`task::perform`], [`task::attempt`] | none             |
//! | `Time`      | none                   | [`time::every`]                |
//! | `Http`      | [`http::request`], [`http::cancel`]  | none             |
//! | `Events`    | none                   | [`events::on`]                 |
//! | `Animation` | none                   | [`animation::on_animation_frame`] |
//!
//! Ports are registered per name with [`ports::OutgoingPort`] and
//! [`ports::IncomingPort`].

pub mod animation;
pub mod events;
pub mod http;
pub mod ports;
pub mod task;
pub mod time;

use crate::config::ProgramConfig;
use crate::effects::Registry;

impl Registry {
    /// The built-in managers, configured from `config`.
    pub fn standard(config: &ProgramConfig) -> Self {
        let mut registry = Self::new();
        registry.insert(task::TaskManager);
        registry.insert(time::TimeManager);
        registry.insert(http::HttpManager::new().with_default_timeout(config.http_timeout));
        registry.insert(events::EventsManager);
        registry.insert(animation::AnimationManager);
        registry
    }
}
