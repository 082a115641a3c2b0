use std::path::PathBuf;

use thiserror::Error;

/// Failures the coordination protocol can surface to its caller.
///
/// Lock contention, unreadable lock files and unreachable primaries are
/// *not* here: the coordinator recovers from those internally and they are
/// signalled as `false` / `None` returns on the individual operations.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The port probe budget ran out without finding a free port.
    #[error("no free port found after {attempts} probes starting at {start}")]
    NoFreePort { start: u16, attempts: u32 },

    /// The target port stayed occupied after terminating its holders.
    #[error("port {port} is still in use after terminating its holders")]
    PortStillInUse { port: u16 },

    /// The target port is occupied and killing holders was disabled.
    #[error("port {port} is in use; rerun without --no-kill to evict the holder")]
    PortHeldNoKill { port: u16 },

    /// The running primary answered the transition request with a refusal.
    #[error("the running primary refused the version transition")]
    TransitionDenied,

    /// Another instance won the lock between the old primary leaving and us
    /// re-electing.
    #[error("lost the election race after a version transition")]
    TransitionRaceLost,

    /// Lock file I/O other than "already exists": permissions, the path is
    /// a directory, disk trouble.
    #[error("lock file {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
