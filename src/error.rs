#![forbid(unsafe_code)]

use thiserror::Error;

////////////////////////////////////////////////////////////////////////////////

/// Errors surfaced by the codec core.
///
/// `Data` is fatal for the session: the state machine parks itself in a
/// terminal error state and only [`crate::inflate::Inflater::sync`] or
/// [`crate::inflate::Inflater::reset`] can revive it. `Buf` is not fatal and
/// not sticky: it means neither input nor output allowed any forward progress,
/// so the same call should be repeated with more room. `Stream` means the
/// operation is invalid in the session's current state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid compressed data: {0}")]
    Data(&'static str),

    #[error("no progress possible, call again with more input or output space")]
    Buf,

    #[error("stream misuse: {0}")]
    Stream(&'static str),
}

/// Non-error outcomes of a decompress call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Progress was made; the stream continues.
    Ok,
    /// The final block and trailer were fully consumed and verified.
    StreamEnd,
    /// The zlib header declares a preset dictionary; supply it via
    /// `set_dictionary` before calling `decompress` again.
    NeedDict,
}

/// Byte counts and status for one decompress call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub consumed: usize,
    pub produced: usize,
    pub status: Status,
}
