use crate::types::DatasetKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("Dataset is busy: {0}")]
    Busy(String),

    #[error("Operation '{operation}' is not allowed on a {kind}")]
    OperationNotAllowed {
        operation: &'static str,
        kind: DatasetKind,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command failed ({}): {}", exit_label(.code), .stderr.trim())]
    ToolFailure { code: Option<i32>, stderr: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
