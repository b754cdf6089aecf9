//! `hostlink call` command implementation

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use hostlink::{Plugin, PluginBuilder};
use tracing::debug;

use crate::cli::PolicyArgs;
use crate::error::{CliError, CliResult};

use super::build_manifest;

/// Options of one `call` invocation
pub struct CallOptions {
    pub wasm: String,
    pub function: String,
    pub input: Option<String>,
    pub input_file: Option<PathBuf>,
    pub manifest: bool,
    pub wasi: bool,
    pub policy: PolicyArgs,
}

/// Build the plugin, call the function and write its output to stdout
pub fn run(options: CallOptions) -> CliResult<()> {
    let input = match (&options.input, &options.input_file) {
        (Some(input), _) => input.as_bytes().to_vec(),
        (None, Some(path)) => std::fs::read(path)?,
        (None, None) => Vec::new(),
    };

    let mut plugin = build_plugin(&options)?;
    debug!(
        plugin_id = %plugin.id(),
        function = %options.function,
        input_len = input.len(),
        "Calling function"
    );

    if !plugin.function_exists(&options.function) {
        return Err(CliError::InvalidArgument(format!(
            "plugin has no function `{}`",
            options.function
        )));
    }

    let output = plugin.call(&options.function, &input)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output)?;
    stdout.flush()?;
    Ok(())
}

fn build_plugin(options: &CallOptions) -> CliResult<Plugin> {
    if !options.manifest {
        let manifest = build_manifest(std::slice::from_ref(&options.wasm), &options.policy)?;
        return Ok(Plugin::from_manifest(&manifest, [], options.wasi)?);
    }

    if options.policy.has_sandbox_flags() {
        return Err(CliError::InvalidArgument(
            "only --config can be combined with --manifest".into(),
        ));
    }
    let document = std::fs::read(&options.wasm)?;
    let mut plugin = PluginBuilder::from_bytes(&document)
        .with_wasi(options.wasi)
        .build()?;
    if !options.policy.config.is_empty() {
        let values: BTreeMap<String, String> = options.policy.config.iter().cloned().collect();
        plugin.set_config(&values)?;
    }
    Ok(plugin)
}
