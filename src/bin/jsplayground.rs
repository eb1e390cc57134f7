use anyhow::{bail, Context, Result};
use clap::Parser;
use jsplayground::{InspectOptions, OutputKind, OutputLine, Playground, RealmConfig};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Run a script in a fresh playground realm and print its output.
#[derive(Parser, Debug)]
#[command(name = "jsplayground", version)]
struct Args {
    /// Script to run; `-` reads from stdin.
    script: PathBuf,

    /// Nesting levels rendered before values collapse to a type tag.
    #[arg(long, default_value_t = jsplayground::runtime::inspect::DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Entries rendered per collection.
    #[arg(long, default_value_t = jsplayground::runtime::inspect::DEFAULT_MAX_ITEMS)]
    max_items: usize,

    /// V8 heap limit in megabytes.
    #[arg(long)]
    max_heap_mb: Option<usize>,

    /// Stop once the output has been quiet for this long.
    #[arg(long, default_value_t = 250)]
    settle_ms: u64,

    /// Print each output line as a JSON object.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let code = read_script(&args.script)?;

    let inspect = InspectOptions::default()
        .with_max_depth(args.max_depth)
        .with_max_items(args.max_items);
    let mut config = RealmConfig::new()
        .with_echo_console(false)
        .with_inspect_options(inspect);
    if let Some(megabytes) = args.max_heap_mb {
        config = config.with_max_heap_size(heap_bytes(megabytes)?);
    }

    let playground = Playground::spawn(config).context("invalid realm configuration")?;
    let mut output = playground.subscribe();
    let run_id = playground.start_run(code);
    tracing::debug!(run_id = %run_id, "run started");

    let settle = Duration::from_millis(args.settle_ms);
    let mut printed = 0;
    let mut failed = false;
    loop {
        let log = output.snapshot();
        for line in log.iter().skip(printed) {
            failed |= line.kind == OutputKind::Error;
            print_line(line, args.json)?;
        }
        printed = log.len();

        match tokio::time::timeout(settle, output.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn heap_bytes(megabytes: usize) -> Result<usize> {
    match megabytes.checked_mul(1024 * 1024) {
        Some(bytes) => Ok(bytes),
        None => bail!("--max-heap-mb {megabytes} does not fit in a heap size"),
    }
}

fn read_script(path: &PathBuf) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("failed to read script from stdin")?;
        return Ok(code);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_line(line: &OutputLine, json: bool) -> Result<()> {
    if json {
        let encoded = serde_json::to_string(line).context("failed to encode output line")?;
        writeln!(std::io::stdout(), "{encoded}")?;
        return Ok(());
    }
    if line.is_banner() {
        return Ok(());
    }
    match line.kind {
        OutputKind::Console => writeln!(std::io::stdout(), "{}", line.text)?,
        OutputKind::Error => writeln!(std::io::stderr(), "{}", line.text)?,
    }
    Ok(())
}
