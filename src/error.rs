//! Typed errors for the capture/executor subsystems.
//!
//! Fatal startup failures (`socket`/`bind`/`listen`/`accept`, opening
//! `/dev/mem`, `mmap`) are handled inline at their call sites with
//! `anyhow::Context` and terminate the process directly — see
//! [`crate::listener`]. This enum covers the session-terminal and
//! transient conditions that callers need to match on.

/// Errors a capture or session worker can hit mid-loop.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Write to the client socket failed; the session ends, the listener
    /// resumes.
    #[error("write to client failed: {0}")]
    ClientWrite(#[source] std::io::Error),

    /// A capture subprocess produced less data than the fixed frame
    /// geometry requires; the current iteration is abandoned.
    #[error("short read from capture subprocess: got {got} bytes, wanted {wanted}")]
    ShortRead { got: usize, wanted: usize },

    /// The ping watchdog deadline elapsed with no `ping` command received.
    #[error("ping deadline exceeded")]
    PingTimeout,

    /// Non-recoverable read failure on the notify event probe's pipe.
    #[error("event probe read failed: {0}")]
    ProbeRead(#[source] std::io::Error),
}
