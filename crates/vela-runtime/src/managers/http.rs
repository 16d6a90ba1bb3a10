#![forbid(unsafe_code)]

//! HTTP requests as commands.
//!
//! A [`Request`] pairs what to send with an [`Expect`]: how to interpret
//! the response and which message to produce. Every request runs in its own
//! process. A request may carry a *tracker* name; [`cancel`] aborts the
//! request currently registered under it, and issuing a new request with a
//! tracker that is in use aborts the older one first. A tracker is released
//! once its request finishes.
//!
//! # Invariants
//!
//! 1. Each request yields exactly one message unless it is cancelled, in
//!    which case it yields none.
//! 2. A status outside `200..=299` is always [`Error::BadStatus`], whatever
//!    the expectation.
//!
//! # Failure Modes
//!
//! - A URL that is neither absolute `http(s)://` nor rooted at `/` fails
//!   with [`Error::BadUrl`] without reaching the host.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;
use serde_json::Value;
use vela_json::Decoder;

use crate::effects::{Cmd, EffectManager, Message, Router, Tagger};
use crate::host::{HttpFailure, HttpRequest, HttpResponse};
use crate::scheduler::{ProcessId, kill, spawn};
use crate::task::{Never, Task};

pub const HOME: &str = "Http";

/// Why a request did not produce the expected value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("bad url `{0}`")]
    BadUrl(String),
    #[error("request timed out")]
    Timeout,
    #[error("network error")]
    NetworkError,
    #[error("bad status {0}")]
    BadStatus(u16),
    #[error("bad body: {0}")]
    BadBody(String),
}

impl From<HttpFailure> for Error {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::BadUrl(url) => Self::BadUrl(url),
            HttpFailure::Timeout => Self::Timeout,
            HttpFailure::Network => Self::NetworkError,
        }
    }
}

// ---------------------------------------------------------------------------
// Bodies and expectations
// ---------------------------------------------------------------------------

/// Request payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Text {
        content_type: String,
        content: String,
    },
    Json(Value),
}

impl Body {
    pub fn string(content_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Text {
            content_type: content_type.into(),
            content: content.into(),
        }
    }

    fn into_parts(self) -> (Option<String>, Option<String>) {
        match self {
            Self::Empty => (None, None),
            Self::Text {
                content_type,
                content,
            } => (Some(content_type), Some(content)),
            Self::Json(value) => (Some("application/json".to_owned()), Some(value.to_string())),
        }
    }
}

type Interpret = Rc<dyn Fn(Result<HttpResponse, HttpFailure>) -> Message>;

/// How to turn a response into a message.
pub struct Expect<Msg> {
    interpret: Interpret,
    _msg: std::marker::PhantomData<fn() -> Msg>,
}

impl<Msg> fmt::Debug for Expect<Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Expect(..)")
    }
}

fn expect_with<T: 'static, Msg: 'static>(
    read: impl Fn(HttpResponse) -> Result<T, Error> + 'static,
    to_msg: impl Fn(Result<T, Error>) -> Msg + 'static,
) -> Expect<Msg> {
    Expect {
        interpret: Rc::new(move |outcome: Result<HttpResponse, HttpFailure>| {
            let result = match outcome {
                Ok(response) if (200..300).contains(&response.status) => read(response),
                Ok(response) => Err(Error::BadStatus(response.status)),
                Err(failure) => Err(failure.into()),
            };
            Box::new(to_msg(result)) as Message
        }),
        _msg: std::marker::PhantomData,
    }
}

/// Expect any body, returned as text.
pub fn expect_string<Msg: 'static>(to_msg: impl Fn(Result<String, Error>) -> Msg + 'static) -> Expect<Msg> {
    expect_with(|response| Ok(response.body), to_msg)
}

/// Expect a JSON body accepted by `decoder`.
pub fn expect_json<T: 'static, Msg: 'static>(
    decoder: Decoder<T>,
    to_msg: impl Fn(Result<T, Error>) -> Msg + 'static,
) -> Expect<Msg> {
    expect_with(
        move |response| {
            vela_json::decode::decode_str(&decoder, &response.body)
                .map_err(|err| Error::BadBody(err.to_string()))
        },
        to_msg,
    )
}

/// Expect success and ignore the body.
pub fn expect_whatever<Msg: 'static>(to_msg: impl Fn(Result<(), Error>) -> Msg + 'static) -> Expect<Msg> {
    expect_with(|_| Ok(()), to_msg)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A full request description.
#[derive(Debug)]
pub struct Request<Msg> {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub expect: Expect<Msg>,
    /// Overrides the manager's default timeout.
    pub timeout: Option<Duration>,
    pub tracker: Option<String>,
}

impl<Msg> Request<Msg> {
    pub fn new(method: &str, url: &str, expect: Expect<Msg>) -> Self {
        Self {
            method: method.to_owned(),
            url: url.to_owned(),
            headers: Vec::new(),
            body: Body::Empty,
            expect,
            timeout: None,
            tracker: None,
        }
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn tracker(mut self, tracker: &str) -> Self {
        self.tracker = Some(tracker.to_owned());
        self
    }
}

/// Send `request`.
pub fn request<Msg: 'static>(request: Request<Msg>) -> Cmd<Msg> {
    Cmd::leaf(HOME, HttpCommand::from(request))
}

pub fn get<Msg: 'static>(url: &str, expect: Expect<Msg>) -> Cmd<Msg> {
    request(Request::new("GET", url, expect))
}

pub fn post<Msg: 'static>(url: &str, body: Body, expect: Expect<Msg>) -> Cmd<Msg> {
    request(Request::new("POST", url, expect).body(body))
}

/// Abort the request registered under `tracker`, if any.
pub fn cancel<Msg>(tracker: &str) -> Cmd<Msg> {
    Cmd::leaf(HOME, HttpCommand(Command::Cancel(tracker.to_owned())))
}

/// Command payload of the HTTP manager.
pub struct HttpCommand(Command);

impl<Msg> From<Request<Msg>> for HttpCommand {
    fn from(request: Request<Msg>) -> Self {
        let (content_type, body) = request.body.into_parts();
        HttpCommand(Command::Send(Outgoing {
            request: HttpRequest {
                method: request.method,
                url: request.url,
                headers: request.headers,
                content_type,
                body,
                timeout: request.timeout,
            },
            interpret: request.expect.interpret,
            tracker: request.tracker,
        }))
    }
}

impl fmt::Debug for HttpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Command::Send(out) => f
                .debug_struct("Send")
                .field("request", &out.request)
                .field("tracker", &out.tracker)
                .finish_non_exhaustive(),
            Command::Cancel(tracker) => f.debug_tuple("Cancel").field(tracker).finish(),
        }
    }
}

enum Command {
    Send(Outgoing),
    Cancel(String),
}

struct Outgoing {
    request: HttpRequest,
    interpret: Interpret,
    tracker: Option<String>,
}

fn valid_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    let well_formed = match rest {
        Some(rest) => !rest.is_empty() && !rest.starts_with('/'),
        None => url.starts_with('/'),
    };
    well_formed && !url.chars().any(char::is_whitespace)
}

/// Run one request to completion.
fn send_request(outgoing: Outgoing, default_timeout: Option<Duration>) -> Task<Message> {
    Task::scheduled(move |scheduler, resolver| {
        let Outgoing {
            mut request,
            interpret,
            ..
        } = outgoing;
        if !valid_url(&request.url) {
            tracing::debug!(url = %request.url, "rejected request url");
            resolver.succeed(interpret(Err(HttpFailure::BadUrl(request.url))));
            return None;
        }
        request.timeout = request.timeout.or(default_timeout);
        tracing::debug!(method = %request.method, url = %request.url, "http request");
        let handle = scheduler
            .host()
            .http_request(request, Box::new(move |outcome| resolver.succeed(interpret(outcome))));
        Some(handle.into_hook())
    })
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct HttpState {
    trackers: AHashMap<String, Tracked>,
    next_serial: u64,
}

struct Tracked {
    pid: ProcessId,
    serial: u64,
}

/// Sent to the manager by a tracked request once it has delivered its
/// message. The serial tells a finished request apart from a newer one
/// registered under the same tracker.
#[derive(Debug)]
pub struct Finished {
    tracker: String,
    serial: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HttpManager {
    default_timeout: Option<Duration>,
}

impl HttpManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout applied to requests that do not set their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn apply(&self, router: Router<Finished>, command: Command, mut state: HttpState) -> Task<HttpState> {
        match command {
            Command::Cancel(tracker) => match state.trackers.remove(&tracker) {
                Some(tracked) => kill(tracked.pid).map(move |()| state),
                None => Task::succeed(state),
            },
            Command::Send(outgoing) => {
                let finished = outgoing.tracker.clone().map(|tracker| {
                    state.next_serial += 1;
                    Finished {
                        tracker,
                        serial: state.next_serial,
                    }
                });
                let registration = finished.as_ref().map(|f| (f.tracker.clone(), f.serial));
                let previous = registration
                    .as_ref()
                    .and_then(|(tracker, _)| state.trackers.remove(tracker));
                let abort_previous = match previous {
                    Some(tracked) => kill(tracked.pid),
                    None => Task::succeed(()),
                };
                let app = router.clone();
                let run = send_request(outgoing, self.default_timeout)
                    .and_then(move |message| app.send_to_app(message))
                    .and_then(move |()| match finished {
                        Some(finished) => router.send_to_self(finished),
                        None => Task::succeed(()),
                    });
                abort_previous
                    .and_then(move |()| spawn(run))
                    .map(move |pid| {
                        if let Some((tracker, serial)) = registration {
                            state.trackers.insert(tracker, Tracked { pid, serial });
                        }
                        state
                    })
            }
        }
    }
}

impl EffectManager for HttpManager {
    type State = HttpState;
    type Command = HttpCommand;
    type Subscription = Never;
    type SelfMsg = Finished;

    fn home(&self) -> &str {
        HOME
    }

    fn init(&self) -> Task<HttpState> {
        Task::succeed(HttpState::default())
    }

    fn on_effects(
        &self,
        router: &Router<Finished>,
        commands: Vec<HttpCommand>,
        _subscriptions: Vec<Never>,
        state: HttpState,
    ) -> Task<HttpState> {
        let manager = *self;
        commands
            .into_iter()
            .fold(Task::succeed(state), |chain, HttpCommand(command)| {
                let router = router.clone();
                chain.and_then(move |state| manager.apply(router, command, state))
            })
    }

    fn on_self_msg(
        &self,
        _router: &Router<Finished>,
        finished: Finished,
        mut state: HttpState,
    ) -> Task<HttpState> {
        let current = state
            .trackers
            .get(&finished.tracker)
            .is_some_and(|tracked| tracked.serial == finished.serial);
        if current {
            tracing::trace!(tracker = %finished.tracker, "released tracker");
            state.trackers.remove(&finished.tracker);
        }
        Task::succeed(state)
    }

    fn map_command(&self, tagger: &Tagger, HttpCommand(command): HttpCommand) -> HttpCommand {
        HttpCommand(match command {
            Command::Send(outgoing) => {
                let outer = Rc::clone(tagger);
                let inner = outgoing.interpret;
                Command::Send(Outgoing {
                    interpret: Rc::new(move |outcome| outer(inner(outcome))),
                    ..outgoing
                })
            }
            cancel @ Command::Cancel(_) => cancel,
        })
    }

    fn map_subscription(&self, _tagger: &Tagger, subscription: Never) -> Never {
        match subscription {}
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::effects::{AppSender, Dispatcher, ManagerMsg, Registry, Sub};
    use crate::host::SimulatedHost;
    use crate::scheduler::Scheduler;
    use crate::task::receive;
    use vela_json::decode;

    #[derive(Debug, PartialEq)]
    enum Msg {
        Text(Result<String, Error>),
        Numbers(Result<Vec<i64>, Error>),
        Done(Result<(), Error>),
    }

    struct Fixture {
        host: SimulatedHost,
        scheduler: Scheduler,
        dispatcher: Dispatcher,
        received: Rc<RefCell<Vec<Msg>>>,
    }

    impl Fixture {
        fn new(default_timeout: Option<Duration>) -> Self {
            let host = SimulatedHost::new();
            let scheduler = Scheduler::new(Rc::new(host.clone()));
            let received = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&received);
            let app: AppSender = Rc::new(move |m: Message| {
                if let Ok(m) = m.downcast::<Msg>() {
                    sink.borrow_mut().push(*m);
                }
            });
            let dispatcher = Registry::new()
                .with(HttpManager::new().with_default_timeout(default_timeout))
                .expect("one manager")
                .start(&scheduler, &app);
            Self {
                host,
                scheduler,
                dispatcher,
                received,
            }
        }

        fn run(&self, cmd: Cmd<Msg>) {
            self.dispatcher
                .dispatch(&self.scheduler, cmd.into_raw(), Sub::<Msg>::none().into_raw())
                .expect("dispatch");
        }
    }

    #[test]
    fn url_validation() {
        assert!(valid_url("https://example.com/a"));
        assert!(valid_url("http://localhost:8080"));
        assert!(valid_url("/api/items"));
        assert!(!valid_url("example.com"));
        assert!(!valid_url("https://"));
        assert!(!valid_url("/with space"));
        assert!(!valid_url(""));
    }

    #[test]
    fn json_responses_are_decoded() {
        let fx = Fixture::new(None);
        fx.run(get("/numbers", expect_json(decode::list(decode::int()), Msg::Numbers)));
        assert_eq!(fx.host.pending_requests(), 1);
        assert!(fx.host.respond("/numbers", Ok(HttpResponse::ok("/numbers", "[1,2,3]"))));
        assert_eq!(*fx.received.borrow(), vec![Msg::Numbers(Ok(vec![1, 2, 3]))]);
    }

    #[test]
    fn undecodable_bodies_are_bad_body() {
        let fx = Fixture::new(None);
        fx.run(get("/numbers", expect_json(decode::list(decode::int()), Msg::Numbers)));
        fx.host.respond("/numbers", Ok(HttpResponse::ok("/numbers", "{\"oops\":1}")));
        assert!(matches!(
            fx.received.borrow().as_slice(),
            [Msg::Numbers(Err(Error::BadBody(_)))]
        ));
    }

    #[test]
    fn error_statuses_are_bad_status() {
        let fx = Fixture::new(None);
        fx.run(get("/missing", expect_string(Msg::Text)));
        fx.host.respond("/missing", Ok(HttpResponse::with_status("/missing", 404, "nope")));
        assert_eq!(*fx.received.borrow(), vec![Msg::Text(Err(Error::BadStatus(404)))]);
    }

    #[test]
    fn bad_urls_never_reach_the_host() {
        let fx = Fixture::new(None);
        fx.run(get("not a url", expect_whatever(Msg::Done)));
        assert!(fx.host.requests().is_empty());
        assert_eq!(
            *fx.received.borrow(),
            vec![Msg::Done(Err(Error::BadUrl("not a url".into())))]
        );
    }

    #[test]
    fn default_timeout_applies_when_unset() {
        let fx = Fixture::new(Some(Duration::from_millis(500)));
        fx.run(get("/slow", expect_string(Msg::Text)));
        fx.run(request(
            Request::new("GET", "/slower", expect_string(Msg::Text)).timeout(Duration::from_secs(2)),
        ));
        let timeouts: Vec<_> = fx.host.requests().into_iter().map(|r| r.timeout).collect();
        assert_eq!(
            timeouts,
            vec![Some(Duration::from_millis(500)), Some(Duration::from_secs(2))]
        );
        fx.host.advance(Duration::from_millis(500));
        assert_eq!(*fx.received.borrow(), vec![Msg::Text(Err(Error::Timeout))]);
    }

    #[test]
    fn bodies_and_headers_reach_the_host() {
        let fx = Fixture::new(None);
        fx.run(request(
            Request::new("PUT", "https://api.test/items/1", expect_whatever(Msg::Done))
                .header("x-token", "abc")
                .body(Body::Json(serde_json::json!({"done": true}))),
        ));
        let sent = fx.host.requests();
        assert_eq!(sent[0].method, "PUT");
        assert_eq!(sent[0].headers, vec![("x-token".to_owned(), "abc".to_owned())]);
        assert_eq!(sent[0].content_type.as_deref(), Some("application/json"));
        assert_eq!(sent[0].body.as_deref(), Some("{\"done\":true}"));
    }

    #[test]
    fn cancelling_a_tracker_aborts_silently() {
        let fx = Fixture::new(None);
        fx.run(request(Request::new("GET", "/upload", expect_string(Msg::Text)).tracker("up")));
        assert_eq!(fx.host.pending_requests(), 1);
        fx.run(cancel("up"));
        assert_eq!(fx.host.pending_requests(), 0);
        assert!(fx.received.borrow().is_empty());
        // Cancelling again is a no-op.
        fx.run(cancel("up"));
    }

    #[test]
    fn reusing_a_tracker_aborts_the_older_request() {
        let fx = Fixture::new(None);
        fx.run(request(Request::new("GET", "/first", expect_string(Msg::Text)).tracker("t")));
        fx.run(request(Request::new("GET", "/second", expect_string(Msg::Text)).tracker("t")));
        assert_eq!(fx.host.pending_requests(), 1);
        assert!(!fx.host.respond("/first", Ok(HttpResponse::ok("/first", "1"))));
        assert!(fx.host.respond("/second", Ok(HttpResponse::ok("/second", "2"))));
        assert_eq!(*fx.received.borrow(), vec![Msg::Text(Ok("2".into()))]);
    }

    #[test]
    fn cancelling_after_completion_is_harmless() {
        let fx = Fixture::new(None);
        fx.run(post(
            "/done",
            Body::string("text/plain", "hi"),
            expect_whatever(Msg::Done),
        ));
        fx.host.respond("/done", Ok(HttpResponse::ok("/done", "")));
        fx.run(cancel("never-registered"));
        assert_eq!(*fx.received.borrow(), vec![Msg::Done(Ok(()))]);
    }

    /// Runs the manager's callbacks by hand so its state can be inspected.
    /// Messages it sends to itself are collected instead of handled.
    struct Harness {
        host: SimulatedHost,
        scheduler: Scheduler,
        router: Router<Finished>,
        finished: Rc<RefCell<Vec<Finished>>>,
    }

    fn collect_finished(inbox: Rc<RefCell<Vec<Finished>>>) -> Task<()> {
        receive(move |msg: ManagerMsg| {
            if let ManagerMsg::SelfMsg(erased) = msg
                && let Ok(finished) = erased.downcast::<Finished>()
            {
                inbox.borrow_mut().push(*finished);
            }
            collect_finished(inbox)
        })
    }

    impl Harness {
        fn new() -> Self {
            let host = SimulatedHost::new();
            let scheduler = Scheduler::new(Rc::new(host.clone()));
            let finished = Rc::new(RefCell::new(Vec::new()));
            let mailbox = scheduler.raw_spawn(collect_finished(Rc::clone(&finished)));
            let app: AppSender = Rc::new(|_: Message| {});
            Self {
                host,
                scheduler,
                router: Router::new(mailbox, app),
                finished,
            }
        }

        fn step(&self, task: Task<HttpState>) -> HttpState {
            let out = Rc::new(RefCell::new(None));
            let slot = Rc::clone(&out);
            self.scheduler.raw_spawn(task.map(move |state| *slot.borrow_mut() = Some(state)));
            out.borrow_mut().take().expect("manager steps finish synchronously")
        }

        fn effects(&self, commands: Vec<HttpCommand>, state: HttpState) -> HttpState {
            self.step(HttpManager::new().on_effects(&self.router, commands, Vec::new(), state))
        }

        fn deliver_finished(&self, state: HttpState) -> HttpState {
            let finished: Vec<Finished> = self.finished.borrow_mut().drain(..).collect();
            finished.into_iter().fold(state, |state, msg| {
                self.step(HttpManager::new().on_self_msg(&self.router, msg, state))
            })
        }
    }

    fn tracked(url: &str, tracker: &str) -> HttpCommand {
        HttpCommand::from(Request::new("GET", url, expect_string(Msg::Text)).tracker(tracker))
    }

    #[test]
    fn finished_requests_release_their_tracker() {
        let h = Harness::new();
        let state = h.effects(
            vec![tracked("/a", "up"), HttpCommand::from(Request::new("GET", "/b", expect_string(Msg::Text)))],
            HttpState::default(),
        );
        assert_eq!(state.trackers.len(), 1);

        h.host.respond("/b", Ok(HttpResponse::ok("/b", "")));
        assert!(h.finished.borrow().is_empty());

        h.host.respond("/a", Ok(HttpResponse::ok("/a", "")));
        assert_eq!(h.finished.borrow().len(), 1);
        let state = h.deliver_finished(state);
        assert!(state.trackers.is_empty());
    }

    #[test]
    fn late_completion_keeps_the_newer_request_tracked() {
        let h = Harness::new();
        let state = h.effects(vec![tracked("/old", "t")], HttpState::default());
        h.host.respond("/old", Ok(HttpResponse::ok("/old", "")));

        let state = h.effects(vec![tracked("/new", "t")], state);
        let state = h.deliver_finished(state);
        assert_eq!(state.trackers.len(), 1);

        let state = h.effects(vec![HttpCommand(Command::Cancel("t".into()))], state);
        assert_eq!(h.host.pending_requests(), 0);
        assert!(state.trackers.is_empty());
    }
}
