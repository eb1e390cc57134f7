//! Realm-per-run JavaScript execution for the playground.
//!
//! Every run gets a fresh `deno_core` isolate on its own OS thread with a
//! single-threaded Tokio event loop. The host and a realm share nothing but
//! JSON messages (see [`protocol`]); the session task on the host side turns
//! those messages into the output log consumers subscribe to.

pub mod config;
pub mod handle;
pub mod inspect;
pub mod output;
pub mod protocol;
mod realm;
pub mod session;

// Re-export key types for convenience
pub use config::RealmConfig;
pub use handle::RealmHandle;
pub use inspect::{inspect, InspectOptions};
pub use output::{OutputKind, OutputLine, OutputSubscription};
pub use protocol::{parse_message, ConsoleLevel, Direction, Message, RunId};
pub use session::Playground;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    async fn run_to_first_line(config: RealmConfig, code: &str) -> OutputLine {
        let playground = Playground::spawn(config.with_echo_console(false)).unwrap();
        let mut output = playground.subscribe();
        playground.start_run(code);
        let log = tokio::time::timeout(WAIT, output.wait_for(|log| log.len() >= 2))
            .await
            .expect("output arrived in time")
            .unwrap();
        log[1].clone()
    }

    #[tokio::test]
    async fn test_realm_lifecycle() {
        let mut handle = RealmHandle::spawn(RealmConfig::default()).await.unwrap();
        let ready = tokio::time::timeout(WAIT, handle.recv()).await.unwrap().unwrap();
        assert_eq!(parse_message(&ready), Some(Message::Ready));

        handle
            .post(&Message::RunRequest {
                code: "console.log(40 + 2)".to_string(),
                run_id: RunId::from("life"),
            })
            .unwrap();
        let raw = tokio::time::timeout(WAIT, handle.recv()).await.unwrap().unwrap();
        assert!(matches!(
            parse_message(&raw),
            Some(Message::ConsoleEvent { args, .. }) if args == vec!["42".to_string()]
        ));

        handle.discard();
    }

    #[tokio::test]
    async fn test_runs_do_not_share_globals() {
        let playground = Playground::spawn(RealmConfig::default().with_echo_console(false)).unwrap();
        let mut output = playground.subscribe();

        let first = playground.start_run("globalThis.counter = 1; console.log(counter)");
        tokio::time::timeout(
            WAIT,
            output.wait_for(|log| log.iter().any(|l| l.run_id == first && l.text == "1")),
        )
        .await
        .unwrap()
        .unwrap();

        let second = playground.start_run("console.log(typeof counter)");
        let log = tokio::time::timeout(
            WAIT,
            output.wait_for(|log| log.len() >= 2 && log[0].run_id == second),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(log[1].text, "undefined");
    }

    #[tokio::test]
    async fn test_multiple_playgrounds_concurrently() {
        let mut tasks = Vec::new();
        for i in 0..3 {
            tasks.push(tokio::spawn(async move {
                let line =
                    run_to_first_line(RealmConfig::default(), &format!("console.log({i} + 100)"))
                        .await;
                assert_eq!(line.text, format!("{}", i + 100));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_realm_with_heap_limits() {
        let config = RealmConfig::new()
            .with_max_heap_size(64 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024);
        let line = run_to_first_line(config, "console.log('hello')").await;
        assert_eq!(line.text, "hello");
    }

    #[tokio::test]
    async fn test_realm_with_bootstrap() {
        let config = RealmConfig::new().with_bootstrap_script("globalThis.VERSION = '1.0.0';");
        let line = run_to_first_line(config, "console.log(VERSION)").await;
        assert_eq!(line.text, "1.0.0");
    }

    #[tokio::test]
    async fn test_inspect_options_reach_the_realm() {
        let config = RealmConfig::new()
            .with_inspect_options(InspectOptions::default().with_max_depth(1));
        let line = run_to_first_line(config, "console.log({a: {b: 1}})").await;
        assert_eq!(line.text, "{a: [Object]}");
    }
}
