//! Error types for the playground host.
//!
//! Nothing in here ever crosses the realm boundary. Failures inside user code
//! travel as protocol messages; these variants cover the host's own plumbing.

use thiserror::Error;

/// Errors raised while configuring, spawning or talking to a realm.
#[derive(Error, Debug)]
pub enum PlaygroundError {
    /// The realm configuration is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The OS refused to start the realm thread.
    #[error("failed to spawn realm thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The realm could not install its wiring or run its bootstrap script.
    #[error("realm bootstrap failed: {0}")]
    Bootstrap(String),

    /// The realm side of the channel is gone.
    #[error("realm channel closed")]
    RealmClosed,

    /// The session task has shut down.
    #[error("playground session closed")]
    SessionClosed,

    /// A message could not be encoded for the wire.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PlaygroundError {
    /// Check if this error means the other side of a channel went away.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            PlaygroundError::RealmClosed | PlaygroundError::SessionClosed
        )
    }
}

/// Result type alias for playground operations.
pub type Result<T> = std::result::Result<T, PlaygroundError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_helpers() {
        assert!(PlaygroundError::RealmClosed.is_closed());
        assert!(PlaygroundError::SessionClosed.is_closed());
        assert!(!PlaygroundError::Config("bad".to_string()).is_closed());
    }

    #[test]
    fn test_error_display() {
        let err = PlaygroundError::Config("initial heap exceeds max".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: initial heap exceeds max"
        );
    }
}
