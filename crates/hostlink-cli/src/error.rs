//! CLI error type

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sdk(#[from] hostlink::Error),
}

pub type CliResult<T> = Result<T, CliError>;
