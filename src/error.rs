use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading data, training or persisting a model.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("{} (line: {line}): {msg}", .path.display())]
    Line {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("invalid weights file: {0}")]
    Format(String),

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("sampling failed: {0}")]
    Sampling(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn line(path: impl Into<PathBuf>, line: usize, msg: impl Into<String>) -> Self {
        Error::Line {
            path: path.into(),
            line: line + 1,
            msg: msg.into(),
        }
    }
}
