//! Host-side handle for interacting with one realm thread.

use crate::error::{PlaygroundError, Result};
use crate::runtime::config::RealmConfig;
use crate::runtime::protocol::{Direction, Message};
use crate::runtime::realm::spawn_realm_thread;
use deno_core::v8;
use tokio::sync::{mpsc, oneshot};

/// Owns both ends of one realm's channels. Dropping the handle discards the
/// realm: its inbound channel closes and any running script is terminated.
pub struct RealmHandle {
    tx: Option<mpsc::UnboundedSender<serde_json::Value>>,
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
    isolate: v8::IsolateHandle,
}

impl RealmHandle {
    /// Start a realm thread and wait until its isolate is built.
    ///
    /// The realm announces itself with `READY` on [`recv`](Self::recv) once
    /// its wiring is installed.
    pub async fn spawn(config: RealmConfig) -> Result<Self> {
        config.validate()?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let (outbound, rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();
        spawn_realm_thread(config, inbound, outbound, init_tx)?;

        let isolate = init_rx.await.map_err(|_| PlaygroundError::RealmClosed)??;
        tracing::debug!("realm spawned");
        Ok(Self {
            tx: Some(tx),
            rx,
            isolate,
        })
    }

    fn sender(&self) -> Result<&mpsc::UnboundedSender<serde_json::Value>> {
        self.tx.as_ref().ok_or(PlaygroundError::RealmClosed)
    }

    /// Send a host-to-realm message.
    pub fn post(&self, message: &Message) -> Result<()> {
        if message.direction() != Direction::HostToRealm {
            tracing::trace!(message = ?message, "refusing to post a realm-to-host message");
            return Ok(());
        }
        let wire = message.to_wire()?;
        self.sender()?
            .send(wire)
            .map_err(|_| PlaygroundError::RealmClosed)
    }

    /// Next raw payload from the realm; `None` once the realm thread is gone.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }

    pub fn is_discarded(&self) -> bool {
        self.tx.is_none()
    }

    /// Tear the realm down. Never blocks on the realm thread.
    pub fn discard(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.tx.take().is_some() {
            self.rx.close();
            self.isolate.terminate_execution();
            tracing::debug!("realm discarded");
        }
    }
}

impl Drop for RealmHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
