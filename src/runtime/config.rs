//! Realm configuration.
//!
//! One [`RealmConfig`] is cloned into every realm a playground spawns, so a
//! fresh run always starts from the same heap limits and wiring options.

use crate::error::{PlaygroundError, Result};
use crate::runtime::inspect::InspectOptions;
use serde::{Deserialize, Serialize};

/// Configuration for a single realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Script run after the wiring is installed and before `READY` is sent.
    pub bootstrap_script: Option<String>,

    /// Forward intercepted console calls to the original console methods.
    pub echo_console: bool,

    /// Budgets used when rendering console arguments and thrown values.
    pub inspect: InspectOptions,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            echo_console: true,
            inspect: InspectOptions::default(),
        }
    }
}

impl RealmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_bootstrap_script(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_echo_console(mut self, echo: bool) -> Self {
        self.echo_console = echo;
        self
    }

    pub fn with_inspect_options(mut self, inspect: InspectOptions) -> Self {
        self.inspect = inspect;
        self
    }

    /// Check the heap limits before any thread is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(PlaygroundError::Config(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(PlaygroundError::Config(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if self.max_heap_size == Some(0) {
            return Err(PlaygroundError::Config(
                "max_heap_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// V8 heap limits, if any were requested.
    pub(crate) fn heap_limits(&self) -> Option<(usize, usize)> {
        self.max_heap_size
            .map(|max| (self.initial_heap_size.unwrap_or(0), max))
    }
}
