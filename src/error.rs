//! Error type shared by the code, hex and sandbox layers.
//!
//! Every fallible operation returns [`Result`]. The code/hex layer also
//! mirrors its most recent failure into a per-thread slot readable through
//! [`last_error`], so diagnostics from one thread never clobber another's.

use std::cell::RefCell;
use std::io;

use crate::sandbox::SandboxMode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hex parse failed at offset {offset}: {message}")]
    HexParse { offset: usize, message: String },

    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    #[error("invalid block: {0}")]
    InvalidBlock(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("exec alloc failed: {0}")]
    Alloc(#[source] io::Error),

    #[error("exec protect failed: {0}")]
    Protect(#[source] io::Error),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("{operation} is not supported in {mode} mode")]
    UnsupportedMode {
        operation: &'static str,
        mode: SandboxMode,
    },

    #[error("failed to create limit container: {0}")]
    Container(#[source] io::Error),

    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(#[source] io::Error),

    #[error("process control failed: {0}")]
    Process(#[source] io::Error),

    #[error("sandbox is already running")]
    AlreadyRunning,

    #[error("sandbox is not running")]
    NotRunning,

    #[error("sandbox has been destroyed")]
    Destroyed,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Overwrite this thread's last-error slot with `err`'s message.
pub(crate) fn record(err: &Error) {
    let message = err.to_string();
    tracing::debug!("{}", message);
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

/// Record `err` and hand it back, for use in `map_err` / `Err(...)` chains.
pub(crate) fn fail<T>(err: Error) -> Result<T> {
    record(&err);
    Err(err)
}

/// Most recent failure message of the code/hex layer on the calling thread.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}
