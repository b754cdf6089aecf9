//! Log output setup for embedders without their own subscriber.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber writing to `path` with `filter` as its
/// directive (e.g. `"info"` or `"hostlink=debug"`).
///
/// `stdout` and `stderr` select the standard streams; any other path is
/// appended to. Returns `false` if the filter is invalid, the file cannot be
/// opened, or a global subscriber is already installed.
pub fn set_log_file(path: impl AsRef<Path>, filter: &str) -> bool {
    let Ok(filter) = EnvFilter::try_new(filter) else {
        return false;
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let path = path.as_ref();
    let installed = match path.to_str() {
        Some("stdout") => builder.with_writer(std::io::stdout).try_init(),
        Some("stderr") => builder.with_writer(std::io::stderr).try_init(),
        _ => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(_) => return false,
            };
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    };
    installed.is_ok()
}

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!version().is_empty());
        assert_eq!(version().split('.').count(), 3);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        assert!(!set_log_file("stderr", "hostlink=notalevel"));
    }

    #[test]
    fn test_second_install_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("hostlink.log");
        // Whichever test installs first wins; afterwards every install fails.
        set_log_file(&log, "info");
        assert!(!set_log_file(&log, "info"));
    }
}
