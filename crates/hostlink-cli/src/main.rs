//! Hostlink CLI - call WebAssembly plugin functions from the command line

mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Commands};
use commands::call::CallOptions;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so plugin output on stdout stays clean
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call {
            wasm,
            function,
            input,
            input_file,
            manifest,
            wasi,
            policy,
        } => {
            commands::call::run(CallOptions {
                wasm,
                function,
                input,
                input_file,
                manifest,
                wasi,
                policy,
            })?;
        }

        Commands::Manifest { wasm, policy } => {
            commands::manifest::run(&wasm, &policy)?;
        }

        Commands::Version => {
            println!("hostlink {}", hostlink::version());
        }
    }

    Ok(())
}
