//! `nerve` binary: start/stop/status/exec a daemon, or drop into the
//! `EXECUTE_REPL_COMMAND` REPL (SPEC_FULL.md §A.4).

use std::sync::Arc;

use clap::{Parser, Subcommand};
use nerve_cli::{create_node_command, exit_code, repl, LocalBackend, RemoteBackend, RunBackend};
use nerve_serve::{bookkeeping, Daemon, DaemonConfig};

const DEFAULT_DAEMON_NAME: &str = "default";

#[derive(Parser, Debug)]
#[command(name = "nerve")]
#[command(about = "Nerve orchestration kernel: daemon control plane and REPL")]
struct Args {
    #[command(subcommand)]
    cmd: Command,

    /// Daemon name, namespaces the bookkeeping files under /tmp/nerve-<name>.*
    #[arg(long, global = true, default_value = DEFAULT_DAEMON_NAME)]
    name: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a daemon and bind its transports.
    Start(StartArgs),
    /// Stop a running daemon gracefully.
    Stop,
    /// Report whether a daemon is running.
    Status,
    /// Create a node and execute one input against it against a running daemon.
    Exec(ExecArgs),
    /// Interactive REPL speaking the EXECUTE_REPL_COMMAND verbs.
    Repl(ReplArgs),
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Also bind a TCP transport at this address (e.g. 127.0.0.1:9000).
    #[arg(long, value_name = "ADDR")]
    tcp: Option<String>,
    /// Also bind an HTTP transport at this address (e.g. 127.0.0.1:8088).
    #[arg(long, value_name = "ADDR")]
    http: Option<String>,
    /// Run in the foreground (block until Ctrl-C or STOP) instead of returning immediately.
    #[arg(long)]
    foreground: bool,
}

#[derive(clap::Args, Debug)]
struct ExecArgs {
    /// Node id to create (or reuse if it already exists).
    node_id: String,
    /// Backend tag (identity, bash, pty, wezterm, claude-wezterm, openrouter, glm, llm-chat).
    backend: String,
    /// Input to execute against the node once created.
    input: String,
    /// Extra backend params as a JSON object, e.g. '{"command": "echo hi"}'.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    params: String,
}

#[derive(clap::Args, Debug)]
struct ReplArgs {
    /// Talk to a running daemon instead of an in-process session.
    #[arg(long)]
    remote: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::load_and_apply("nerve", None::<&std::path::Path>).ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();

    match args.cmd {
        Command::Start(start_args) => run_start(&args.name, start_args).await,
        Command::Stop => run_stop(&args.name).await,
        Command::Status => run_status(&args.name),
        Command::Exec(exec_args) => run_exec(&args.name, exec_args).await,
        Command::Repl(repl_args) => run_repl(&args.name, repl_args).await,
    }
}

async fn run_start(name: &str, args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = DaemonConfig { tcp_addr: args.tcp, http_addr: args.http };
    let daemon = match Daemon::start(name, config).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("nerve: {e}");
            std::process::exit(1);
        }
    };
    println!("nerve daemon '{name}' started");

    if args.foreground {
        daemon.wait_for_shutdown().await;
    }
    Ok(())
}

async fn run_stop(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !bookkeeping::is_running(name) {
        eprintln!("nerve: daemon '{name}' is not running");
        std::process::exit(1);
    }
    let backend = RemoteBackend::for_daemon(name);
    let response = backend
        .send(nerve::command::Command { command_type: "STOP".to_string(), params: serde_json::Value::Null })
        .await;
    if !response.success {
        if let Some(err) = &response.error {
            eprintln!("nerve: {err}");
        }
        std::process::exit(1);
    }
    println!("nerve daemon '{name}' stopped");
    Ok(())
}

fn run_status(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    if bookkeeping::is_running(name) {
        println!("nerve daemon '{name}' is running");
        Ok(())
    } else {
        println!("nerve daemon '{name}' is not running");
        std::process::exit(1);
    }
}

async fn run_exec(name: &str, args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let params: serde_json::Value = serde_json::from_str(&args.params).unwrap_or(serde_json::json!({}));
    let backend: Arc<dyn RunBackend> = if bookkeeping::is_running(name) {
        Arc::new(RemoteBackend::for_daemon(name))
    } else {
        Arc::new(LocalBackend::new(name.to_string()))
    };

    let create = backend.send(create_node_command(&args.node_id, &args.backend, params)).await;
    if !create.success {
        eprintln!("nerve: {}", create.error.unwrap_or_default());
        std::process::exit(1);
    }

    let response = backend.send(nerve_cli::execute_input_command(&args.node_id, args.input)).await;
    match serde_json::to_string_pretty(&response) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("nerve: {e}"),
    }
    std::process::exit(exit_code(&response));
}

async fn run_repl(name: &str, args: ReplArgs) -> Result<(), Box<dyn std::error::Error>> {
    let backend: Box<dyn RunBackend> = if args.remote || bookkeeping::is_running(name) {
        Box::new(RemoteBackend::for_daemon(name))
    } else {
        Box::new(LocalBackend::new(name.to_string()))
    };
    let code = repl::run(backend.as_ref()).await;
    std::process::exit(code);
}
