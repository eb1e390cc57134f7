//! Core of a JavaScript code playground.
//!
//! User code runs in a fresh, isolated realm per run; console output, thrown
//! errors and unhandled rejections stream back to the host as validated
//! messages and land in an ordered output log.
//!
//! ```no_run
//! use jsplayground::{Playground, RealmConfig};
//!
//! # async fn demo() -> jsplayground::Result<()> {
//! let playground = Playground::spawn(RealmConfig::default())?;
//! let mut output = playground.subscribe();
//! playground.start_run("console.log(1, 'a', {b: 2})");
//! let log = output.wait_for(|log| log.len() >= 2).await?;
//! assert_eq!(log[1].text, "1 a {b: 2}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod runtime;

pub use error::{PlaygroundError, Result};
pub use runtime::{
    inspect, parse_message, ConsoleLevel, InspectOptions, Message, OutputKind, OutputLine,
    OutputSubscription, Playground, RealmConfig, RealmHandle, RunId,
};
