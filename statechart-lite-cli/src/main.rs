//! statechart-lite — thin CLI over the interpreter core.
//!
//! `check` parses and validates a machine description; `run` simulates it
//! with stub bindings (logging actions, always-true guards, immediately
//! resolving services), feeding events from the command line and printing
//! the state string after each.
//!
//! Exit codes: 0 success, 2 parse error, 3 bind error, 4 graph error,
//! 5 runtime step error, 1 anything else.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use statechart_lite_core::{
    action_fn, build_graph, guard_fn, parse_document, service_fn, BuildOptions, DefinitionError,
    Machine, MachineStatus, Registry,
};

#[derive(Parser)]
#[command(name = "statechart-lite", version, about = "Hierarchical state machine interpreter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a machine description.
    Check {
        /// Path to the description file.
        file: PathBuf,
    },
    /// Start a machine with stub bindings and feed it events.
    Run {
        /// Path to the description file.
        file: PathBuf,
        /// Event to send, repeatable and sent in order.
        #[arg(short, long = "event")]
        events: Vec<String>,
        /// Print every entered state instead of only the leaves.
        #[arg(long)]
        full: bool,
        /// Grace period in ms for `after` timers before exiting.
        #[arg(long, default_value_t = 0)]
        settle_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Check { file } => check(&file),
        Command::Run {
            file,
            events,
            full,
            settle_ms,
        } => run(&file, &events, full, settle_ms).await,
    };
    std::process::exit(code);
}

fn read(file: &Path) -> Result<String, i32> {
    std::fs::read_to_string(file).map_err(|err| {
        eprintln!("error: cannot read {}: {err}", file.display());
        1
    })
}

fn definition_exit(err: &DefinitionError) -> i32 {
    eprintln!("error: {err}");
    err.exit_code()
}

fn check(file: &Path) -> i32 {
    let text = match read(file) {
        Ok(text) => text,
        Err(code) => return code,
    };
    let doc = match parse_document(&text) {
        Ok(doc) => doc,
        Err(err) => return definition_exit(&err),
    };
    match build_graph(&doc, &BuildOptions::default()) {
        Ok(graph) => {
            println!(
                "ok: {} states, version {}",
                graph.len(),
                hex_prefix(&graph.definition_version)
            );
            0
        }
        Err(err) => definition_exit(&err),
    }
}

async fn run(file: &Path, events: &[String], full: bool, settle_ms: u64) -> i32 {
    let text = match read(file) {
        Ok(text) => text,
        Err(code) => return code,
    };
    let doc = match parse_document(&text) {
        Ok(doc) => doc,
        Err(err) => return definition_exit(&err),
    };
    let graph = match build_graph(&doc, &BuildOptions::default()) {
        Ok(graph) => graph,
        Err(err) => return definition_exit(&err),
    };

    let machine = match Machine::from_description(&text, stub_registry(&graph)) {
        Ok(machine) => machine,
        Err(err) => return definition_exit(&err),
    };

    match machine.start().await {
        Ok(state) => println!("start -> {state}"),
        Err(err) => {
            eprintln!("error: {err}");
            return 5;
        }
    }

    for event in events {
        match machine.send(event).await {
            Ok(_) => {
                println!("{event} -> {}", machine.active_state_names(!full));
            }
            Err(err) => {
                eprintln!("error: {err}");
                return 5;
            }
        }
    }

    if settle_ms > 0 {
        tokio::time::sleep(Duration::from_millis(settle_ms)).await;
        println!("settled -> {}", machine.active_state_names(!full));
    }

    if machine.status() == MachineStatus::Error {
        eprintln!("error: machine finished in Error status");
        return 5;
    }
    0
}

/// Bind every referenced name to a stub: actions log, guards pass,
/// services resolve immediately.
fn stub_registry(graph: &statechart_lite_core::StateGraph) -> Registry {
    let mut registry = Registry::new();
    for name in graph.action_names() {
        let name = name.to_string();
        let logged = name.clone();
        registry.add_action(
            name,
            action_fn(move |scope| {
                tracing::info!(action = %logged, state = %scope.state(), "action");
                Ok(())
            }),
        );
    }
    for name in graph.guard_names() {
        registry.add_guard(name.to_string(), guard_fn(|_| true));
    }
    for name in graph.service_names() {
        registry.add_service(
            name.to_string(),
            service_fn(|_job| async { Ok(serde_json::Value::Null) }),
        );
    }
    registry
}

fn hex_prefix(digest: &[u8; 32]) -> String {
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}
