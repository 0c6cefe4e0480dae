//! CLI entry point: loads configuration, wires up logging, and runs the
//! server until killed (spec §6).

use std::fs;
use std::sync::Arc;

use clap::Parser;
use gdbstub_rsp::{Config, NullDebugger, Server};
use tracing_subscriber::EnvFilter;

/// A debug server speaking the GDB remote serial protocol.
#[derive(Parser, Debug)]
#[command(name = "gdbstubd", version, about)]
struct Args {
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Overrides `listen.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides `executor.threads`.
    #[arg(long)]
    threads: Option<usize>,

    /// Raises the tracing filter to `debug` (repeat for `trace`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "gdbstub_rsp=info",
        1 => "gdbstub_rsp=debug",
        _ => "gdbstub_rsp=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();
}

fn load_config(args: &Args) -> Config {
    let mut config = match &args.config {
        Some(path) => match fs::read_to_string(path) {
            Ok(text) => Config::from_toml_str(&text).unwrap_or_else(|e| {
                eprintln!("failed to parse {path}: {e}, using defaults");
                Config::default()
            }),
            Err(e) => {
                eprintln!("failed to read {path}: {e}, using defaults");
                Config::default()
            }
        },
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.listen.port = port;
    }
    if let Some(threads) = args.threads {
        config.executor.threads = threads;
    }
    config
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    let config = load_config(&args);

    let executor = gdbstub_rsp::executor::Executor::new(config.executor.threads)
        .expect("failed to build executor runtime");
    let server = Server::new(config, Arc::new(NullDebugger));

    executor.block_on(async {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "server exited with error");
            std::process::exit(1);
        }
    });
}
