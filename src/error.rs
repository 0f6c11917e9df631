//! Error type shared by every layer of the crate.
//!
//! Configuration and missing-file errors are meant to be fatal for a run; they
//! carry enough context (path, quantity, species, timestep, rank) to tell the
//! operator which file broke without re-running under a debugger.

use std::path::PathBuf;
use thiserror::Error;

pub type PicResult<T> = Result<T, PicError>;

#[derive(Error, Debug)]
pub enum PicError {
    /// Grid/topology mismatch, non-divisible decomposition, bad config values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or zero-length input file.
    #[error("cannot access {quantity} file '{}'{}: {reason}", path.display(), fmt_tindex(*tindex))]
    FileAccess {
        path: PathBuf,
        quantity: String,
        tindex: Option<usize>,
        reason: String,
    },

    /// A collective read/write failed, or the file extent does not cover the layout.
    #[error("collective I/O on '{}' failed (rank {rank}, displacement {displacement}): {reason}", path.display())]
    CollectiveIo {
        path: PathBuf,
        rank: usize,
        displacement: u64,
        reason: String,
    },

    /// The tracked open/closed state of a handle does not allow the operation.
    #[error("handle state error on '{}': {reason}", path.display())]
    HandleState { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed run configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

fn fmt_tindex(tindex: Option<usize>) -> String {
    match tindex {
        Some(t) => format!(" at tindex {t}"),
        None => String::new(),
    }
}

impl PicError {
    pub fn config(msg: impl Into<String>) -> Self {
        PicError::Configuration(msg.into())
    }

    pub fn missing(path: impl Into<PathBuf>, quantity: impl Into<String>, tindex: Option<usize>) -> Self {
        PicError::FileAccess {
            path: path.into(),
            quantity: quantity.into(),
            tindex,
            reason: "file does not exist".to_string(),
        }
    }

    /// Fills in the quantity/timestep of a `FileAccess` error raised below the
    /// field store, where only the path is known.
    pub(crate) fn with_quantity(self, name: &str, at: Option<usize>) -> Self {
        match self {
            PicError::FileAccess {
                path,
                quantity,
                tindex,
                reason,
            } => PicError::FileAccess {
                path,
                quantity: if quantity.is_empty() {
                    name.to_string()
                } else {
                    quantity
                },
                tindex: tindex.or(at),
                reason,
            },
            other => other,
        }
    }
}
