//! Output lines and the read-only view consumers subscribe to.

use crate::error::{PlaygroundError, Result};
use crate::runtime::protocol::{ConsoleLevel, Message, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Console,
    Error,
}

/// One rendered entry of the output log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub kind: OutputKind,
    /// Console method that produced the line; absent for errors and banners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<ConsoleLevel>,
    pub text: String,
    /// Host-side receipt time.
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
}

pub const REJECTION_PREFIX: &str = "Unhandled rejection: ";

impl OutputLine {
    /// Synthetic first line of every run.
    pub fn banner(run_id: &RunId) -> Self {
        Self {
            kind: OutputKind::Console,
            level: None,
            text: format!("--- run {run_id} ---"),
            timestamp: Utc::now(),
            run_id: run_id.clone(),
        }
    }

    /// Error line produced by the host itself, e.g. when a realm cannot start.
    pub fn host_error(run_id: &RunId, text: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Error,
            level: None,
            text: text.into(),
            timestamp: Utc::now(),
            run_id: run_id.clone(),
        }
    }

    pub fn is_banner(&self) -> bool {
        self.kind == OutputKind::Console && self.level.is_none()
    }

    /// Render a realm message as a line, for the kinds that produce output.
    pub fn from_message(message: Message, timestamp: DateTime<Utc>) -> Option<Self> {
        let line = match message {
            Message::ConsoleEvent {
                level,
                args,
                run_id,
            } => Self {
                kind: OutputKind::Console,
                level: Some(level),
                text: args.join(" "),
                timestamp,
                run_id,
            },
            Message::RuntimeError {
                message,
                stack,
                run_id,
            } => Self {
                kind: OutputKind::Error,
                level: None,
                text: error_text("", &message, stack.as_deref()),
                timestamp,
                run_id,
            },
            Message::UnhandledRejection {
                message,
                stack,
                run_id,
            } => Self {
                kind: OutputKind::Error,
                level: None,
                text: error_text(REJECTION_PREFIX, &message, stack.as_deref()),
                timestamp,
                run_id,
            },
            Message::Ready | Message::RunRequest { .. } | Message::ResetRequest => return None,
        };
        Some(line)
    }
}

fn error_text(prefix: &str, message: &str, stack: Option<&str>) -> String {
    match stack {
        Some(stack) => format!("{prefix}{message}\n{stack}"),
        None => format!("{prefix}{message}"),
    }
}

/// Read-only view of the output log.
#[derive(Debug, Clone)]
pub struct OutputSubscription {
    rx: watch::Receiver<Vec<OutputLine>>,
}

impl OutputSubscription {
    pub(crate) fn new(rx: watch::Receiver<Vec<OutputLine>>) -> Self {
        Self { rx }
    }

    /// Current contents of the log.
    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.rx.borrow().clone()
    }

    /// Wait until the log changes after the last observed version.
    pub async fn changed(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| PlaygroundError::SessionClosed)
    }

    /// Wait until `predicate` holds for the log and return that version.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<Vec<OutputLine>>
    where
        F: FnMut(&[OutputLine]) -> bool,
    {
        let log = self
            .rx
            .wait_for(|log| predicate(log))
            .await
            .map_err(|_| PlaygroundError::SessionClosed)?;
        Ok(log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunId {
        RunId::from("r1")
    }

    #[test]
    fn test_console_args_join_with_spaces() {
        let line = OutputLine::from_message(
            Message::ConsoleEvent {
                level: ConsoleLevel::Log,
                args: vec!["1".into(), "a".into(), "{b: 2}".into()],
                run_id: run(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(line.kind, OutputKind::Console);
        assert_eq!(line.level, Some(ConsoleLevel::Log));
        assert_eq!(line.text, "1 a {b: 2}");
        assert!(!line.is_banner());
    }

    #[test]
    fn test_error_text_places_stack_on_next_line() {
        let line = OutputLine::from_message(
            Message::RuntimeError {
                message: "boom".into(),
                stack: Some("Error: boom\n    at <anonymous>:1:7".into()),
                run_id: run(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(line.kind, OutputKind::Error);
        assert_eq!(line.text, "boom\nError: boom\n    at <anonymous>:1:7");
    }

    #[test]
    fn test_rejection_prefix() {
        let line = OutputLine::from_message(
            Message::UnhandledRejection {
                message: "42".into(),
                stack: None,
                run_id: run(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(line.text, "Unhandled rejection: 42");
    }

    #[test]
    fn test_control_messages_produce_no_line() {
        assert!(OutputLine::from_message(Message::Ready, Utc::now()).is_none());
        assert!(OutputLine::from_message(Message::ResetRequest, Utc::now()).is_none());
    }

    #[test]
    fn test_banner_carries_run_id() {
        let banner = OutputLine::banner(&run());
        assert!(banner.is_banner());
        assert_eq!(banner.run_id, run());
        assert!(banner.text.contains("r1"));
    }

    #[test]
    fn test_line_serializes_camel_case() {
        let line = OutputLine::host_error(&run(), "failed");
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["kind"], "error");
        assert_eq!(value["runId"], "r1");
        assert!(value.get("level").is_none());
    }

    #[tokio::test]
    async fn test_subscription_waits_for_predicate() {
        let (tx, rx) = watch::channel(Vec::new());
        let mut subscription = OutputSubscription::new(rx);
        assert!(subscription.snapshot().is_empty());

        tx.send_modify(|log| log.push(OutputLine::banner(&run())));
        let log = subscription.wait_for(|log| !log.is_empty()).await.unwrap();
        assert_eq!(log.len(), 1);

        drop(tx);
        assert!(subscription.changed().await.is_err());
    }
}
