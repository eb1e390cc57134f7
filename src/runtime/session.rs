//! Run session manager.
//!
//! A single Tokio task owns the output log and the current realm. Consumers
//! talk to it through [`Playground`], whose methods only enqueue commands, so
//! none of them ever wait on user code.

use crate::error::Result;
use crate::runtime::config::RealmConfig;
use crate::runtime::handle::RealmHandle;
use crate::runtime::output::{OutputLine, OutputSubscription};
use crate::runtime::protocol::{parse_message, Direction, Message, RunId};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

enum Command {
    StartRun { code: String, run_id: RunId },
    ClearOutput,
}

/// Where the current run stands.
enum Phase {
    Idle,
    /// Realm spawned, waiting for its `READY` before sending the staged request.
    Starting { pending: Message },
    Executing,
}

enum Event {
    Command(Option<Command>),
    Realm(Option<serde_json::Value>),
}

/// Consumer-facing handle to a run session.
#[derive(Clone)]
pub struct Playground {
    commands: mpsc::UnboundedSender<Command>,
    output: watch::Receiver<Vec<OutputLine>>,
    active: watch::Receiver<Option<RunId>>,
}

impl Playground {
    /// Start the session task. Must be called from within a Tokio runtime.
    pub fn spawn(config: RealmConfig) -> Result<Self> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (output_tx, output) = watch::channel(Vec::new());
        let (active_tx, active) = watch::channel(None);

        let session = Session {
            config,
            output: output_tx,
            active: active_tx,
            realm: None,
            phase: Phase::Idle,
        };
        tokio::spawn(session.run(command_rx));

        Ok(Self {
            commands,
            output,
            active,
        })
    }

    /// Request a new run of `code`. Returns at once; output arrives on the
    /// subscription.
    pub fn start_run(&self, code: impl Into<String>) -> RunId {
        let run_id = RunId::generate();
        let command = Command::StartRun {
            code: code.into(),
            run_id: run_id.clone(),
        };
        if self.commands.send(command).is_err() {
            tracing::warn!(run_id = %run_id, "session task is gone; run dropped");
        }
        run_id
    }

    /// Empty the output log.
    pub fn clear_output(&self) {
        if self.commands.send(Command::ClearOutput).is_err() {
            tracing::warn!("session task is gone; clear dropped");
        }
    }

    pub fn subscribe(&self) -> OutputSubscription {
        OutputSubscription::new(self.output.clone())
    }

    /// Run id the session currently accepts output for, as last published.
    pub fn active_run(&self) -> Option<RunId> {
        self.active.borrow().clone()
    }
}

struct Session {
    config: RealmConfig,
    output: watch::Sender<Vec<OutputLine>>,
    active: watch::Sender<Option<RunId>>,
    realm: Option<RealmHandle>,
    phase: Phase,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = match self.realm.as_mut() {
                Some(realm) => tokio::select! {
                    biased;
                    command = commands.recv() => Event::Command(command),
                    raw = realm.recv() => Event::Realm(raw),
                },
                None => Event::Command(commands.recv().await),
            };

            match event {
                Event::Command(Some(Command::StartRun { code, run_id })) => {
                    self.start(code, run_id).await;
                }
                Event::Command(Some(Command::ClearOutput)) => self.clear(),
                Event::Command(None) => break,
                Event::Realm(Some(raw)) => self.on_realm_message(raw),
                Event::Realm(None) => self.on_realm_closed(),
            }
        }

        if let Some(realm) = self.realm.take() {
            realm.discard();
        }
        tracing::debug!("session task finished");
    }

    async fn start(&mut self, code: String, run_id: RunId) {
        if let Some(previous) = self.realm.take() {
            previous.discard();
        }
        self.phase = Phase::Idle;

        tracing::debug!(run_id = %run_id, "starting run");
        self.active.send_replace(Some(run_id.clone()));
        self.output.send_replace(vec![OutputLine::banner(&run_id)]);

        match RealmHandle::spawn(self.config.clone()).await {
            Ok(realm) => {
                self.realm = Some(realm);
                self.phase = Phase::Starting {
                    pending: Message::RunRequest { code, run_id },
                };
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "failed to start realm");
                self.append(OutputLine::host_error(&run_id, err.to_string()));
            }
        }
    }

    fn clear(&mut self) {
        self.output.send_if_modified(|log| {
            let changed = !log.is_empty();
            log.clear();
            changed
        });
    }

    fn append(&mut self, line: OutputLine) {
        self.output.send_modify(|log| log.push(line));
    }

    fn on_realm_message(&mut self, raw: serde_json::Value) {
        let Some(message) = parse_message(&raw) else {
            tracing::trace!("dropping malformed realm message");
            return;
        };

        match self.phase {
            Phase::Starting { .. } if message == Message::Ready => self.dispatch(),
            Phase::Executing => {
                let active = self.active.borrow().clone();
                if let Some(line) = admit(message, active.as_ref(), Utc::now()) {
                    self.append(line);
                }
            }
            _ => {
                tracing::trace!(message = ?message, "dropping realm message outside an executing run");
            }
        }
    }

    fn dispatch(&mut self) {
        let Phase::Starting { pending } = std::mem::replace(&mut self.phase, Phase::Executing) else {
            return;
        };
        let Some(realm) = self.realm.as_ref() else {
            self.phase = Phase::Idle;
            return;
        };
        if let Some(run_id) = pending.run_id() {
            tracing::debug!(run_id = %run_id, "realm ready; dispatching run");
        }
        if let Err(err) = realm.post(&pending) {
            tracing::warn!(error = %err, "failed to dispatch run");
        }
    }

    fn on_realm_closed(&mut self) {
        self.realm = None;
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let Some(run_id) = self.active.borrow().clone() else {
            return;
        };
        let text = match phase {
            Phase::Starting { .. } => "realm exited before it was ready",
            Phase::Executing => "realm exited unexpectedly",
            Phase::Idle => return,
        };
        tracing::warn!(run_id = %run_id, "{}", text);
        self.append(OutputLine::host_error(&run_id, text));
    }
}

/// Activity filter: keep realm-to-host output carrying the active run id.
pub(crate) fn admit(
    message: Message,
    active: Option<&RunId>,
    received_at: DateTime<Utc>,
) -> Option<OutputLine> {
    if message.direction() != Direction::RealmToHost {
        tracing::trace!("dropping host-to-realm message received from realm");
        return None;
    }
    let active = active?;
    if message.run_id() != Some(active) {
        tracing::trace!(active = %active, "dropping message from a stale run");
        return None;
    }
    OutputLine::from_message(message, received_at)
}
