//! Realm thread backed by `deno_core::JsRuntime`.
//!
//! Each realm hosts one V8 isolate on a dedicated OS thread with a
//! single-threaded Tokio runtime. The host talks to it only through JSON
//! messages; everything user code does comes back the same way.

use crate::error::{PlaygroundError, Result};
use crate::runtime::config::RealmConfig;
use crate::runtime::inspect::{inspect, render_number, InspectOptions};
use crate::runtime::protocol::{parse_message, ConsoleLevel, Message, RunId};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};

/// Installed once per realm before `READY`. Captures what it needs from
/// `Deno.core`, then removes the namespace from the global scope.
const BOOTSTRAP_JS: &str = r#"
((bridge) => {
    "use strict";
    const core = globalThis.Deno.core;
    const apply = Reflect.apply;
    const emitConsole = bridge.console;
    const emitError = bridge.error;
    const emitRejection = bridge.rejection;
    const echo = bridge.echo;

    const target = globalThis.console ?? (globalThis.console = {});
    for (const level of ["log", "info", "warn", "error", "debug"]) {
        const original = target[level];
        target[level] = function (...args) {
            apply(emitConsole, undefined, [level, ...args]);
            if (echo && typeof original === "function") {
                apply(original, target, args);
            }
        };
    }

    let depth = 0;
    const guard = (callback, args, level) => () => {
        const saved = depth;
        depth = level;
        try {
            apply(callback, globalThis, args);
        } catch (error) {
            emitError(error);
        } finally {
            depth = saved;
        }
    };
    const delayOf = (timeout) => {
        const millis = Number(timeout);
        return millis > 0 ? Math.floor(millis) : 0;
    };
    const schedule = (repeat) => function (callback, timeout = 0, ...args) {
        if (typeof callback !== "function") {
            throw new TypeError("timer callback must be a function");
        }
        const level = depth + 1;
        return core.queueUserTimer(level, repeat, delayOf(timeout), guard(callback, args, level));
    };
    const clear = (id) => {
        if (typeof id === "number") {
            core.cancelTimer(id);
        }
    };
    globalThis.setTimeout = schedule(false);
    globalThis.setInterval = schedule(true);
    globalThis.clearTimeout = clear;
    globalThis.clearInterval = clear;

    core.setUnhandledPromiseRejectionHandler((_promise, reason) => {
        emitRejection(reason);
        return true;
    });

    delete globalThis.Deno;
})
"#;

/// Realm-side state reachable from native callbacks through the isolate slot.
struct RealmBridge {
    outbound: mpsc::UnboundedSender<serde_json::Value>,
    run_id: RefCell<Option<RunId>>,
    inspect: InspectOptions,
}

impl RealmBridge {
    fn current(scope: &mut v8::HandleScope) -> Option<Rc<RealmBridge>> {
        scope.get_slot::<Rc<RealmBridge>>().cloned()
    }

    fn active_run(&self) -> Option<RunId> {
        self.run_id.borrow().clone()
    }

    fn send(&self, message: &Message) {
        match message.to_wire() {
            Ok(wire) => {
                if self.outbound.send(wire).is_err() {
                    tracing::trace!("host side of realm channel closed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode realm message"),
        }
    }

    fn report(&self, kind: Report, message: String, stack: Option<String>) {
        let Some(run_id) = self.active_run() else {
            tracing::trace!("dropping {:?} raised before any run", kind);
            return;
        };
        let message = match kind {
            Report::Error => Message::RuntimeError {
                message,
                stack,
                run_id,
            },
            Report::Rejection => Message::UnhandledRejection {
                message,
                stack,
                run_id,
            },
        };
        self.send(&message);
    }
}

#[derive(Debug, Clone, Copy)]
enum Report {
    Error,
    Rejection,
}

/// Outcome of one turn of the serve loop.
enum Step {
    Inbound(serde_json::Value),
    EventLoop(Option<String>),
    Closed,
}

pub(crate) fn spawn_realm_thread(
    config: RealmConfig,
    inbound: mpsc::UnboundedReceiver<serde_json::Value>,
    outbound: mpsc::UnboundedSender<serde_json::Value>,
    init: oneshot::Sender<Result<v8::IsolateHandle>>,
) -> Result<()> {
    std::thread::Builder::new()
        .name("jsplayground-realm".to_string())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init.send(Err(PlaygroundError::Spawn(err)));
                    return;
                }
            };
            let built = {
                let _guard = tokio_rt.enter();
                Realm::new(config, outbound)
            };
            let mut realm = match built {
                Ok(realm) => realm,
                Err(err) => {
                    let _ = init.send(Err(err));
                    return;
                }
            };
            if init.send(Ok(realm.isolate_handle())).is_err() {
                return;
            }

            tokio_rt.block_on(realm.serve(inbound));
            tracing::debug!("realm thread exiting");
        })
        .map_err(PlaygroundError::Spawn)?;
    Ok(())
}

struct Realm {
    js_runtime: JsRuntime,
    bridge: Rc<RealmBridge>,
    accepted_run: bool,
}

impl Realm {
    fn new(config: RealmConfig, outbound: mpsc::UnboundedSender<serde_json::Value>) -> Result<Self> {
        config.validate()?;
        let create_params = config
            .heap_limits()
            .map(|(initial, max)| v8::CreateParams::default().heap_limits(initial, max));

        let RealmConfig {
            bootstrap_script,
            echo_console,
            inspect,
            ..
        } = config;

        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            create_params,
            ..Default::default()
        });

        let bridge = Rc::new(RealmBridge {
            outbound,
            run_id: RefCell::new(None),
            inspect,
        });
        js_runtime.v8_isolate().set_slot(bridge.clone());

        install_wiring(&mut js_runtime, echo_console)?;

        if let Some(script) = bootstrap_script {
            js_runtime
                .execute_script("<bootstrap>", script)
                .map_err(|err| PlaygroundError::Bootstrap(err.to_string()))?;
        }

        Ok(Self {
            js_runtime,
            bridge,
            accepted_run: false,
        })
    }

    fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.js_runtime.v8_isolate().thread_safe_handle()
    }

    async fn serve(&mut self, mut inbound: mpsc::UnboundedReceiver<serde_json::Value>) {
        self.bridge.send(&Message::Ready);

        let mut loop_active = false;
        loop {
            let step = tokio::select! {
                raw = inbound.recv() => match raw {
                    Some(raw) => Step::Inbound(raw),
                    None => Step::Closed,
                },
                outcome = self.js_runtime.run_event_loop(PollEventLoopOptions::default()), if loop_active => {
                    Step::EventLoop(outcome.err().map(|err| err.to_string()))
                }
            };

            match step {
                Step::Inbound(raw) => {
                    if self.handle_inbound(raw) {
                        loop_active = true;
                    }
                }
                Step::EventLoop(None) => {
                    // Nothing left to drive; only a new message can wake us.
                    loop_active = false;
                }
                Step::EventLoop(Some(err)) => {
                    // An event-loop error leaves the runtime unusable; stop driving it.
                    self.bridge.report(Report::Error, err, None);
                    loop_active = false;
                }
                Step::Closed => break,
            }
        }
    }

    /// Returns true when a run was started.
    fn handle_inbound(&mut self, raw: serde_json::Value) -> bool {
        match parse_message(&raw) {
            Some(Message::RunRequest { code, run_id }) => {
                if self.accepted_run {
                    tracing::debug!(run_id = %run_id, "realm already ran; ignoring RUN");
                    return false;
                }
                self.accepted_run = true;
                self.run(&code, run_id);
                true
            }
            Some(Message::ResetRequest) => {
                tracing::trace!("RESET received; realm replacement handles recovery");
                false
            }
            Some(other) => {
                tracing::trace!(message = ?other, "dropping message sent in the wrong direction");
                false
            }
            None => {
                tracing::trace!("dropping malformed inbound message");
                false
            }
        }
    }

    fn run(&mut self, code: &str, run_id: RunId) {
        tracing::debug!(run_id = %run_id, "executing run");
        *self.bridge.run_id.borrow_mut() = Some(run_id);

        let inspect = self.bridge.inspect;
        let failure = {
            let scope = &mut self.js_runtime.handle_scope();
            let scope = &mut v8::TryCatch::new(scope);
            let completed = match v8::String::new(scope, code) {
                Some(source) => match v8::Script::compile(scope, source, None) {
                    Some(script) => script.run(scope).is_some(),
                    None => false,
                },
                None => false,
            };

            if completed || scope.has_terminated() {
                None
            } else if let Some(exception) = scope.exception() {
                Some(describe_exception(scope, exception, inspect))
            } else {
                Some(("script source could not be loaded".to_string(), None))
            }
        };

        if let Some((message, stack)) = failure {
            self.bridge.report(Report::Error, message, stack);
        }
    }
}

fn install_wiring(js_runtime: &mut JsRuntime, echo_console: bool) -> Result<()> {
    let installer = js_runtime
        .execute_script("<playground:bootstrap>", BOOTSTRAP_JS)
        .map_err(|err| PlaygroundError::Bootstrap(err.to_string()))?;

    let scope = &mut js_runtime.handle_scope();
    let installer = v8::Local::new(scope, installer);
    let installer = v8::Local::<v8::Function>::try_from(installer)
        .map_err(|_| PlaygroundError::Bootstrap("installer is not a function".to_string()))?;

    let bridge = v8::Object::new(scope);
    set_function(scope, bridge, "console", emit_console)?;
    set_function(scope, bridge, "error", emit_runtime_error)?;
    set_function(scope, bridge, "rejection", emit_rejection)?;
    let echo = v8::Boolean::new(scope, echo_console);
    set_property(scope, bridge, "echo", echo.into())?;

    let scope = &mut v8::TryCatch::new(scope);
    let receiver = v8::undefined(scope).into();
    if installer.call(scope, receiver, &[bridge.into()]).is_none() {
        let reason = match scope.exception() {
            Some(exception) => exception.to_rust_string_lossy(scope),
            None => "installer did not complete".to_string(),
        };
        return Err(PlaygroundError::Bootstrap(reason));
    }
    Ok(())
}

fn set_function(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Result<()> {
    let function = v8::Function::new(scope, callback)
        .ok_or_else(|| PlaygroundError::Bootstrap(format!("failed to create bridge.{name}")))?;
    set_property(scope, target, name, function.into())
}

fn set_property(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    name: &str,
    value: v8::Local<v8::Value>,
) -> Result<()> {
    let key = v8::String::new(scope, name)
        .ok_or_else(|| PlaygroundError::Bootstrap(format!("failed to allocate key {name}")))?;
    target
        .set(scope, key.into(), value)
        .ok_or_else(|| PlaygroundError::Bootstrap(format!("failed to set bridge.{name}")))?;
    Ok(())
}

/// `bridge.console(level, ...args)`
fn emit_console<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _rv: v8::ReturnValue,
) {
    let Some(bridge) = RealmBridge::current(scope) else {
        return;
    };
    let level = args.get(0).to_rust_string_lossy(scope);
    let Some(level) = ConsoleLevel::from_name(&level) else {
        return;
    };
    let Some(run_id) = bridge.active_run() else {
        tracing::trace!(%level, "dropping console call made before any run");
        return;
    };

    let rendered = (1..args.length())
        .map(|index| render_argument(scope, args.get(index), bridge.inspect))
        .collect();
    bridge.send(&Message::ConsoleEvent {
        level,
        args: rendered,
        run_id,
    });
}

/// `bridge.error(thrown)`
fn emit_runtime_error<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _rv: v8::ReturnValue,
) {
    let Some(bridge) = RealmBridge::current(scope) else {
        return;
    };
    let (message, stack) = describe_exception(scope, args.get(0), bridge.inspect);
    bridge.report(Report::Error, message, stack);
}

/// `bridge.rejection(reason)`
fn emit_rejection<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _rv: v8::ReturnValue,
) {
    let Some(bridge) = RealmBridge::current(scope) else {
        return;
    };
    let (message, stack) = describe_exception(scope, args.get(0), bridge.inspect);
    bridge.report(Report::Rejection, message, stack);
}

/// Strings pass through raw, numbers use JavaScript formatting, everything
/// else goes through the inspector.
fn render_argument<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    options: InspectOptions,
) -> String {
    if value.is_string() {
        return value.to_rust_string_lossy(scope);
    }
    if value.is_number() {
        if let Some(text) = render_number(scope, value) {
            return text;
        }
    }
    inspect(scope, value, options)
}

/// Message and stack for a thrown value or rejection reason.
pub(crate) fn describe_exception<'s>(
    scope: &mut v8::HandleScope<'s>,
    exception: v8::Local<'s, v8::Value>,
    options: InspectOptions,
) -> (String, Option<String>) {
    if exception.is_native_error() {
        if let Ok(error) = v8::Local::<v8::Object>::try_from(exception) {
            let scope = &mut v8::TryCatch::new(scope);
            let message = read_string(scope, error, "message").filter(|m| !m.is_empty());
            let stack = read_string(scope, error, "stack").filter(|s| !s.is_empty());
            let message = match message {
                Some(message) => message,
                None => exception
                    .to_detail_string(scope)
                    .map(|detail| detail.to_rust_string_lossy(scope))
                    .unwrap_or_else(|| "Error".to_string()),
            };
            return (message, stack);
        }
    }
    (inspect(scope, exception, options), None)
}

fn read_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Option<String> {
    let key = v8::String::new(scope, name)?;
    let value = object.get(scope, key.into())?;
    if !value.is_string() {
        return None;
    }
    Some(value.to_rust_string_lossy(scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe_js(source: &str) -> (String, Option<String>) {
        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        let global = runtime
            .execute_script("<realm-test>", source.to_string())
            .expect("fixture evaluates");
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, global);
        describe_exception(scope, local, InspectOptions::default())
    }

    #[test]
    fn test_describe_native_error() {
        let (message, stack) = describe_js("new RangeError('out of range')");
        assert_eq!(message, "out of range");
        let stack = stack.expect("errors carry a stack");
        assert!(stack.starts_with("RangeError: out of range"));
    }

    #[test]
    fn test_describe_error_without_message_uses_name() {
        let (message, _) = describe_js("new TypeError()");
        assert_eq!(message, "TypeError");
    }

    #[test]
    fn test_describe_non_error_uses_inspector() {
        assert_eq!(describe_js("42"), ("42".to_string(), None));
        assert_eq!(describe_js("({code: 7})"), ("{code: 7}".to_string(), None));
    }

    #[test]
    fn test_describe_error_with_hostile_message_getter() {
        let (message, _) = describe_js(
            "(() => { const e = new Error('x'); Object.defineProperty(e, 'message', { get() { throw 1; } }); return e; })()",
        );
        assert_eq!(message, "Error");
    }

    fn collect(
        rx: &mut mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            messages.push(parse_message(&raw).expect("realm emits valid messages"));
        }
        messages
    }

    #[test]
    fn test_realm_reports_console_and_throws() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut realm = Realm::new(RealmConfig::default().with_echo_console(false), tx)
            .expect("realm builds");
        realm.run(
            "console.log(1, 'a', {b: 2}); console.warn(-0); null.x;",
            RunId::from("r1"),
        );

        let messages = collect(&mut rx);
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0],
            Message::ConsoleEvent {
                level: ConsoleLevel::Log,
                args: vec!["1".into(), "a".into(), "{b: 2}".into()],
                run_id: RunId::from("r1"),
            }
        );
        assert!(matches!(
            &messages[1],
            Message::ConsoleEvent { level: ConsoleLevel::Warn, args, .. } if args == &vec!["-0".to_string()]
        ));
        match &messages[2] {
            Message::RuntimeError {
                message,
                stack,
                run_id,
            } => {
                assert!(message.to_lowercase().contains("cannot read properties of null"));
                assert!(stack.as_deref().is_some_and(|s| !s.is_empty()));
                assert_eq!(run_id.as_str(), "r1");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut realm = Realm::new(RealmConfig::default(), tx).expect("realm builds");
        realm.run("let = ;", RunId::from("r1"));
        let messages = collect(&mut rx);
        assert!(matches!(
            messages.as_slice(),
            [Message::RuntimeError { .. }]
        ));
    }

    #[test]
    fn test_deno_namespace_is_removed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut realm = Realm::new(RealmConfig::default(), tx).expect("realm builds");
        realm.run("console.log(typeof Deno)", RunId::from("r1"));
        let messages = collect(&mut rx);
        assert!(matches!(
            messages.as_slice(),
            [Message::ConsoleEvent { args, .. }] if args == &vec!["undefined".to_string()]
        ));
    }

    #[test]
    fn test_bootstrap_script_runs_before_user_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RealmConfig::default().with_bootstrap_script("globalThis.greeting = 'hi';");
        let mut realm = Realm::new(config, tx).expect("realm builds");
        realm.run("console.info(greeting)", RunId::from("r1"));
        let messages = collect(&mut rx);
        assert!(matches!(
            messages.as_slice(),
            [Message::ConsoleEvent { level: ConsoleLevel::Info, args, .. }] if args == &vec!["hi".to_string()]
        ));
    }

    #[test]
    fn test_failing_bootstrap_script_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = RealmConfig::default().with_bootstrap_script("throw new Error('nope')");
        assert!(matches!(
            Realm::new(config, tx),
            Err(PlaygroundError::Bootstrap(_))
        ));
    }

    #[test]
    fn test_console_before_run_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RealmConfig::default().with_bootstrap_script("console.log('early')");
        let _realm = Realm::new(config, tx).expect("realm builds");
        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_serve_emits_ready_and_accepts_one_run() {
        let (to_realm, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_realm) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();
        spawn_realm_thread(RealmConfig::default(), inbound, outbound, init_tx).unwrap();
        init_rx.await.unwrap().unwrap();

        let ready = from_realm.recv().await.unwrap();
        assert_eq!(parse_message(&ready), Some(Message::Ready));

        for (code, id) in [("console.log('first')", "r1"), ("console.log('second')", "r2")] {
            let request = Message::RunRequest {
                code: code.to_string(),
                run_id: RunId::from(id),
            };
            to_realm.send(request.to_wire().unwrap()).unwrap();
        }
        to_realm
            .send(serde_json::json!({"type": "RESET"}))
            .unwrap();
        to_realm
            .send(serde_json::json!({"type": "RUN", "code": "1"}))
            .unwrap();

        let first = from_realm.recv().await.unwrap();
        assert!(matches!(
            parse_message(&first),
            Some(Message::ConsoleEvent { run_id, .. }) if run_id.as_str() == "r1"
        ));

        drop(to_realm);
        // The thread drops its sender once the inbound channel closes.
        assert!(from_realm.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_timers_and_rejections_are_reported() {
        let (to_realm, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_realm) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();
        spawn_realm_thread(RealmConfig::default(), inbound, outbound, init_tx).unwrap();
        init_rx.await.unwrap().unwrap();
        assert_eq!(
            parse_message(&from_realm.recv().await.unwrap()),
            Some(Message::Ready)
        );

        let request = Message::RunRequest {
            code: r#"
                setTimeout((word) => console.log(word), 5, 'later');
                setTimeout(() => { throw new Error('tick'); }, 10);
                Promise.reject(new Error('boom'));
            "#
            .to_string(),
            run_id: RunId::from("r1"),
        };
        to_realm.send(request.to_wire().unwrap()).unwrap();

        let mut messages = Vec::new();
        while messages.len() < 3 {
            let raw = from_realm.recv().await.expect("realm stays alive");
            messages.push(parse_message(&raw).unwrap());
        }
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::UnhandledRejection { message, .. } if message == "boom"
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::ConsoleEvent { args, .. } if args == &vec!["later".to_string()]
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::RuntimeError { message, .. } if message == "tick"
        )));
    }
}
