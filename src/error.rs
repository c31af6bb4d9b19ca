//! Error taxonomy for the undo log engine.
//!
//! Invariant violations (mismatched `advance` offsets, double attach of a
//! control slot, and the like) are programmer errors and are raised with
//! `panic!`/`assert!` at the call site instead of being represented here —
//! they are fatal to the process, not recoverable conditions a caller can
//! act on.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, UndoError>;

#[derive(Debug, Error)]
pub enum UndoError {
    /// A log could not be grown or a successor log could not be created
    /// (no free control slot, or the filesystem is out of space). The
    /// writer transaction that hit this must abort.
    #[error("no space available to allocate undo log: {0}")]
    ResourceExhausted(String),

    /// A decoded record header implies sections that don't fit in the
    /// remaining record length, or names a `type` outside the enumerated
    /// set. Fatal to the current operation; replay cannot proceed past it.
    #[error("corrupt undo record: {0}")]
    CorruptRecord(String),

    /// A checkpoint file failed its fixed-name-format or checksum check.
    #[error("invalid checkpoint file {path}: {reason}")]
    InvalidCheckpoint { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Segment I/O (`segment.rs`) is written against `anyhow::Result` since it
/// sits at a boundary where callers just want `.context()`, not a typed
/// error to match on. The log manager calls into it but still needs to
/// hand its own callers a typed `UndoError`, so failures there collapse to
/// `Io` with the `anyhow::Error`'s formatted chain as the message.
impl From<anyhow::Error> for UndoError {
    fn from(err: anyhow::Error) -> Self {
        UndoError::Io(std::io::Error::other(err.to_string()))
    }
}
