#![forbid(unsafe_code)]

//! End-to-end tests: one application using every built-in manager, driven
//! through a simulated host and an in-memory document.

use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Value, json};
use vela_json::{Decoder, decode};
use vela_runtime::managers::{animation, events, http, ports, time};
use vela_runtime::{
    Application, Cmd, EventTarget, HttpResponse, Program, ProgramConfig, Registry, RuntimeError,
    SimulatedHost, Sub, Task, perform,
};
use vela_vdom::html::{self, id, on_click, text};
use vela_vdom::{Html, MemoryDocument, NodeId};

// ---------------------------------------------------------------------------
// Application under test
// ---------------------------------------------------------------------------

struct Dashboard;

#[derive(Debug, Default)]
struct Model {
    endpoint: String,
    count: i64,
    ticking: bool,
    ticks: Vec<u64>,
    fetched: Option<Result<Vec<i64>, http::Error>>,
    keys: Vec<String>,
    animating: bool,
    frames: Vec<Duration>,
    inbox: Vec<String>,
    chain: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq)]
enum Msg {
    Inc,
    Dec,
    ToggleTicking,
    Tick(u64),
    Fetch,
    CancelFetch,
    Fetched(Result<Vec<i64>, http::Error>),
    Key(String),
    ToggleAnimation,
    Frame(Duration),
    Save,
    Inbound(String),
    Chain(u32),
}

impl Application for Dashboard {
    type Model = Model;
    type Msg = Msg;
    type Flags = String;

    fn flags_decoder(&self) -> Decoder<String> {
        decode::field("endpoint", decode::string())
    }

    fn init(&self, endpoint: String) -> (Model, Cmd<Msg>) {
        let model = Model {
            endpoint,
            ..Model::default()
        };
        (model, Cmd::none())
    }

    fn update(&self, model: &mut Model, msg: Msg) -> Cmd<Msg> {
        match msg {
            Msg::Inc => model.count += 1,
            Msg::Dec => model.count -= 1,
            Msg::ToggleTicking => model.ticking = !model.ticking,
            Msg::Tick(at) => model.ticks.push(at),
            Msg::Fetch => {
                let request = http::Request::new(
                    "GET",
                    &model.endpoint,
                    http::expect_json(decode::list(decode::int()), Msg::Fetched),
                )
                .tracker("fetch");
                return http::request(request);
            }
            Msg::CancelFetch => return http::cancel("fetch"),
            Msg::Fetched(result) => model.fetched = Some(result),
            Msg::Key(key) => model.keys.push(key),
            Msg::ToggleAnimation => model.animating = !model.animating,
            Msg::Frame(delta) => model.frames.push(delta),
            Msg::Save => return ports::send("saved", json!({ "count": model.count })),
            Msg::Inbound(text) => model.inbox.push(text),
            Msg::Chain(0) => model.chain.push(0),
            Msg::Chain(n) => {
                model.chain.push(n);
                return perform(Task::succeed(n - 1), Msg::Chain);
            }
        }
        Cmd::none()
    }

    fn view(&self, model: &Model) -> Html<Msg> {
        let status = match &model.fetched {
            None => "idle".to_owned(),
            Some(Ok(items)) => format!("{} items", items.len()),
            Some(Err(err)) => err.to_string(),
        };
        html::div(
            vec![],
            vec![
                html::button(vec![id("inc"), on_click(Msg::Inc)], vec![text("+")]),
                html::span(vec![id("count")], vec![text(model.count.to_string())]),
                html::button(vec![id("dec"), on_click(Msg::Dec)], vec![text("-")]),
                html::button(vec![id("fetch"), on_click(Msg::Fetch)], vec![text("fetch")]),
                html::p(vec![id("status")], vec![text(status)]),
                html::ul(
                    vec![id("keys")],
                    model.keys.iter().map(|k| html::li(vec![], vec![text(k)])).collect(),
                ),
            ],
        )
    }

    fn subscriptions(&self, model: &Model) -> Sub<Msg> {
        let mut subs = vec![
            events::on(
                EventTarget::Document,
                "keydown",
                decode::field("key", decode::string()).map(Msg::Key),
            ),
            ports::subscribe("inbox", decode::string().map(Msg::Inbound)),
        ];
        if model.ticking {
            subs.push(time::every(Duration::from_secs(1), |t| Msg::Tick(t.millis())));
        }
        if model.animating {
            subs.push(animation::on_animation_frame_delta(Msg::Frame));
        }
        Sub::batch(subs)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    host: SimulatedHost,
    program: Program<Dashboard, MemoryDocument>,
}

impl Harness {
    fn start() -> Self {
        Self::with_config(
            ProgramConfig::default()
                .with_flags(json!({ "endpoint": "/api/items" }))
                .with_http_timeout(Duration::from_secs(5)),
        )
    }

    fn with_config(config: ProgramConfig) -> Self {
        let host = SimulatedHost::from_config(&config);
        let mut doc = MemoryDocument::new();
        let body = doc.create_root("body");
        let registry = Registry::standard(&config)
            .with(ports::OutgoingPort::new("saved"))
            .and_then(|r| r.with(ports::IncomingPort::new("inbox")))
            .expect("port names are free");
        let program = Program::start(Dashboard, &config, registry, Rc::new(host.clone()), doc, body)
            .expect("program starts");
        Self { host, program }
    }

    fn node(&self, element_id: &str) -> NodeId {
        let root = self.program.root().expect("running");
        self.program
            .with_document(|doc| doc.find_id(root, element_id))
            .expect("running")
            .unwrap_or_else(|| panic!("no element #{element_id}"))
    }

    fn click(&self, element_id: &str) {
        let target = self.node(element_id);
        self.program
            .dispatch_event(target, "click", &Value::Null)
            .expect("click handled");
    }

    fn text_of(&self, element_id: &str) -> String {
        let node = self.node(element_id);
        self.program
            .with_document(|doc| doc.text_content(node))
            .expect("running")
    }

    fn model<R>(&self, f: impl FnOnce(&Model) -> R) -> R {
        self.program.with_model(f).expect("running")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn flags_come_from_config() {
    let h = Harness::start();
    assert_eq!(h.model(|m| m.endpoint.clone()), "/api/items");
    assert_eq!(h.text_of("status"), "idle");
}

#[test]
fn missing_flags_are_rejected() {
    let mut doc = MemoryDocument::new();
    let body = doc.create_root("body");
    let config = ProgramConfig::default().with_flags(json!({ "url": "/x" }));
    let err = Program::start(
        Dashboard,
        &config,
        Registry::standard(&config),
        Rc::new(SimulatedHost::new()),
        doc,
        body,
    )
    .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidFlags(_)));
}

#[test]
fn clicks_rerender_synchronously() {
    let h = Harness::start();
    h.click("inc");
    h.click("inc");
    h.click("dec");
    assert_eq!(h.text_of("count"), "1");
    assert_eq!(h.program.updates(), 3);
}

#[test]
fn ticks_follow_the_model() {
    let h = Harness::start();
    h.host.advance(Duration::from_secs(2));
    assert!(h.model(|m| m.ticks.is_empty()));

    h.program.send(Msg::ToggleTicking).expect("running");
    h.host.advance(Duration::from_millis(3500));
    assert_eq!(h.model(|m| m.ticks.clone()), vec![3000, 4000, 5000]);

    h.program.send(Msg::ToggleTicking).expect("running");
    assert_eq!(h.host.pending_timers(), 0);
    h.host.advance(Duration::from_secs(10));
    assert_eq!(h.model(|m| m.ticks.len()), 3);
}

#[test]
fn fetch_success_renders_items() {
    let h = Harness::start();
    h.click("fetch");
    let sent = h.host.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].url, "/api/items");
    assert_eq!(sent[0].timeout, Some(Duration::from_secs(5)));

    assert!(h.host.respond("/api/items", Ok(HttpResponse::ok("/api/items", "[4, 5, 6]"))));
    assert_eq!(h.model(|m| m.fetched.clone()), Some(Ok(vec![4, 5, 6])));
    assert_eq!(h.text_of("status"), "3 items");
}

#[test]
fn fetch_failures_are_values() {
    let h = Harness::start();
    h.click("fetch");
    h.host.respond("/api/items", Ok(HttpResponse::with_status("/api/items", 503, "")));
    assert_eq!(
        h.model(|m| m.fetched.clone()),
        Some(Err(http::Error::BadStatus(503)))
    );
    assert_eq!(h.text_of("status"), "bad status 503");
    assert!(h.program.error().is_none());
}

#[test]
fn fetch_times_out_with_the_configured_default() {
    let h = Harness::start();
    h.click("fetch");
    h.host.advance(Duration::from_millis(4999));
    assert!(h.model(|m| m.fetched.is_none()));
    h.host.advance(Duration::from_millis(1));
    assert_eq!(h.model(|m| m.fetched.clone()), Some(Err(http::Error::Timeout)));
}

#[test]
fn cancelled_fetch_never_reports() {
    let h = Harness::start();
    h.click("fetch");
    h.program.send(Msg::CancelFetch).expect("running");
    assert_eq!(h.host.pending_requests(), 0);
    h.host.advance(Duration::from_secs(10));
    assert!(h.model(|m| m.fetched.is_none()));
}

#[test]
fn document_events_are_decoded() {
    let h = Harness::start();
    assert_eq!(h.host.listener_count(), 1);
    h.host.emit(EventTarget::Document, "keydown", &json!({ "key": "j" }));
    h.host.emit(EventTarget::Document, "keydown", &json!({ "which": 75 }));
    h.host.emit(EventTarget::Document, "keydown", &json!({ "key": "k" }));
    assert_eq!(h.model(|m| m.keys.clone()), vec!["j", "k"]);
    assert_eq!(h.text_of("keys"), "jk");
}

#[test]
fn animation_frames_report_deltas() {
    let config = ProgramConfig::default()
        .with_flags(json!({ "endpoint": "/api/items" }))
        .with_animation_frame(Duration::from_millis(20));
    let h = Harness::with_config(config);
    h.program.send(Msg::ToggleAnimation).expect("running");
    assert_eq!(h.host.pending_frames(), 1);
    h.host.advance_frame();
    h.host.advance_frame();
    assert_eq!(
        h.model(|m| m.frames.clone()),
        vec![Duration::from_millis(20), Duration::from_millis(20)]
    );
    h.program.send(Msg::ToggleAnimation).expect("running");
    assert_eq!(h.host.pending_frames(), 0);
}

#[test]
fn ports_carry_json_both_ways() {
    let h = Harness::start();
    h.click("inc");
    h.program.send(Msg::Save).expect("running");
    assert_eq!(h.host.port_messages("saved"), vec![json!({ "count": 1 })]);

    h.program.send_to_port("inbox", json!("hello")).expect("port exists");
    h.program.send_to_port("inbox", json!(42)).expect("port exists");
    assert_eq!(h.model(|m| m.inbox.clone()), vec!["hello"]);
}

#[test]
fn commands_from_update_run_after_render() {
    let h = Harness::start();
    h.program.send(Msg::Chain(3)).expect("running");
    assert_eq!(h.model(|m| m.chain.clone()), vec![3, 2, 1, 0]);
    assert_eq!(h.program.updates(), 4);
}

#[test]
fn stopping_cancels_host_work() {
    let h = Harness::start();
    h.program.send(Msg::ToggleTicking).expect("running");
    h.program.send(Msg::ToggleAnimation).expect("running");
    h.click("fetch");
    assert_eq!(h.host.pending_timers(), 1);
    assert_eq!(h.host.pending_requests(), 1);

    h.program.stop();
    assert_eq!(h.host.pending_timers(), 0);
    assert_eq!(h.host.pending_requests(), 0);
    assert_eq!(h.host.pending_frames(), 0);
    assert_eq!(h.host.listener_count(), 0);
    assert_eq!(h.program.scheduler().process_count(), 0);
    assert_eq!(h.program.send(Msg::Inc), Err(RuntimeError::Stopped));
}

proptest! {
    #[test]
    fn counter_matches_click_sequence(clicks in proptest::collection::vec(any::<bool>(), 0..24)) {
        let h = Harness::start();
        let mut expected = 0_i64;
        for up in clicks {
            h.click(if up { "inc" } else { "dec" });
            expected += if up { 1 } else { -1 };
        }
        prop_assert_eq!(h.model(|m| m.count), expected);
        prop_assert_eq!(h.text_of("count"), expected.to_string());
    }
}
