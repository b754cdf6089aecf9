//! `hostlink manifest` command implementation

use crate::cli::PolicyArgs;
use crate::error::CliResult;

use super::build_manifest;

/// Print the rendered manifest as pretty JSON
pub fn run(sources: &[String], policy: &PolicyArgs) -> CliResult<()> {
    let manifest = build_manifest(sources, policy)?;
    let rendered = serde_json::to_string_pretty(&manifest.render())
        .map_err(hostlink::Error::from)?;
    println!("{rendered}");
    Ok(())
}
