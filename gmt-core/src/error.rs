//! Error taxonomy for the GMT runtime.
//!
//! Configuration and protocol violations are fatal (node, worker/task,
//! source location are logged and the process exits via [`fatal`] rather
//! than unwinding), while a handful of conditions (reservation starvation)
//! are not errors at all and never reach this type.

use std::fmt;

/// Whether a [`GmtError`] should abort the node or can be handled locally.
///
/// Only [`Severity::Warning`] errors are ever returned to a caller that might
/// recover; every [`Severity::Fatal`] error is expected to flow through
/// [`fatal`] and never be matched on by ordinary control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Warning,
}

#[derive(Debug, thiserror::Error)]
pub enum GmtError {
    #[error("configuration invalid: {0}")]
    InvalidConfig(String),

    #[error("array {handle:#x} ({name:?}): out-of-bounds access at byte {offset}, total size {total}")]
    OutOfBounds {
        handle: u64,
        name: Option<String>,
        offset: u64,
        total: u64,
    },

    #[error("local access out of range at offset {offset}, length {len}")]
    OutOfRange { offset: u64, len: u64 },

    #[error("array {0:#x}: double free")]
    DoubleFree(u64),

    #[error("array {0:#x}: access after free")]
    UseAfterFree(u64),

    #[error("element size {0} invalid for atomic op: must be one of 1, 2, 4, 8")]
    BadAtomicElementSize(usize),

    #[error("non-preemptable task attempted a global operation ({0})")]
    NonPreemptableCalledGlobalOp(&'static str),

    #[error("return buffer too large: {got} bytes, max {max}")]
    ReturnBufferTooLarge { got: usize, max: usize },

    #[error("network error: {0}")]
    Network(String),

    #[error("media {0:?} is not implemented by this core (see DESIGN.md)")]
    UnsupportedMedia(Media),

    #[error("no free allocation id on this node (pool exhausted)")]
    AllocationPoolExhausted,

    #[error("no free handle id on this node (pool exhausted)")]
    HandlePoolExhausted,

    #[error("unknown or unattached named array {0:?}")]
    UnknownName(String),
}

impl GmtError {
    pub fn severity(&self) -> Severity {
        use GmtError::*;
        match self {
            InvalidConfig(_)
            | OutOfBounds { .. }
            | OutOfRange { .. }
            | DoubleFree(_)
            | UseAfterFree(_)
            | BadAtomicElementSize(_)
            | NonPreemptableCalledGlobalOp(_)
            | ReturnBufferTooLarge { .. }
            | Network(_)
            | UnsupportedMedia(_)
            | AllocationPoolExhausted
            | HandlePoolExhausted => Severity::Fatal,
            UnknownName(_) => Severity::Warning,
        }
    }
}

/// Allocation media, see `SPEC_FULL.md` §3. Only [`Media::Ram`] is backed by
/// this core; the others round-trip through the handle bits so client code
/// can be written against the full enum without the core committing to
/// out-of-scope persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Ram,
    ShmFile,
    Ssd,
    Disk,
}

impl fmt::Display for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Log full fault context and terminate the process immediately.
///
/// Uses `std::process::exit`, never `panic!`: a panic unwinds through
/// worker/helper stacks and could re-enter scheduler `Drop` impls, which
/// `_exit`-without-unwinding rules out.
#[track_caller]
pub fn fatal(node: u32, thread_role: &str, err: &GmtError) -> ! {
    let loc = std::panic::Location::caller();
    tracing::error!(
        node,
        thread_role,
        error = %err,
        file = loc.file(),
        line = loc.line(),
        "fatal error, terminating node"
    );
    std::process::exit(1);
}

pub type Result<T> = std::result::Result<T, GmtError>;
