//! CLI command definitions using clap

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Hostlink CLI - call WebAssembly plugin functions
#[derive(Parser)]
#[command(name = "hostlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Call a function exported by a plugin
    Call {
        /// Module path, http(s) URL, or manifest file with --manifest
        wasm: String,

        /// Exported function to call
        function: String,

        /// Input passed to the function
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the input from a file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Treat WASM as a JSON manifest document
        #[arg(short, long)]
        manifest: bool,

        /// Link WASI preview1 imports
        #[arg(long)]
        wasi: bool,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Print the manifest built from modules and policy flags
    Manifest {
        /// Module paths or http(s) URLs; the last one is the entry module
        #[arg(required = true)]
        wasm: Vec<String>,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Show version information
    Version,
}

/// Sandbox policy shared by `call` and `manifest`.
#[derive(Args, Debug, Default)]
pub struct PolicyArgs {
    /// Config value visible to the plugin
    #[arg(long = "config", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub config: Vec<(String, String)>,

    /// Host the plugin may send HTTP requests to (`*.` matches subdomains)
    #[arg(long = "allow-host", value_name = "HOST")]
    pub allow_host: Vec<String>,

    /// Directory mapped into the guest
    #[arg(long = "allow-path", value_name = "SRC[:DEST]")]
    pub allow_path: Vec<String>,

    /// Call timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Expected sha256 of the entry module
    #[arg(long, value_name = "SHA256")]
    pub hash: Option<String>,
}

impl PolicyArgs {
    /// Whether any flag beyond `--config` was given.
    pub fn has_sandbox_flags(&self) -> bool {
        !self.allow_host.is_empty()
            || !self.allow_path.is_empty()
            || self.timeout.is_some()
            || self.hash.is_some()
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_key_value("k=").unwrap(), ("k".to_string(), String::new()));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_call_arguments() {
        let cli = Cli::try_parse_from([
            "hostlink",
            "call",
            "plugin.wasm",
            "count_vowels",
            "--input",
            "hello",
            "--config",
            "k=v",
            "--allow-host",
            "*.example.com",
            "--timeout",
            "100",
        ])
        .unwrap();

        match cli.command {
            Commands::Call {
                wasm,
                function,
                input,
                policy,
                ..
            } => {
                assert_eq!(wasm, "plugin.wasm");
                assert_eq!(function, "count_vowels");
                assert_eq!(input.as_deref(), Some("hello"));
                assert_eq!(policy.config, vec![("k".to_string(), "v".to_string())]);
                assert!(policy.has_sandbox_flags());
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_input_flags_conflict() {
        let result = Cli::try_parse_from([
            "hostlink",
            "call",
            "p.wasm",
            "f",
            "--input",
            "a",
            "--input-file",
            "b",
        ]);
        assert!(result.is_err());
    }
}
