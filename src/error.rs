use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::region::RegionError;

// ─── Setup failures ──────────────────────────────────────────────

/// Anything that stops the server before its loop starts.
/// Always fatal: the caller logs it and exits non-zero.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot create shared region {name:?}: {source}")]
    Region {
        name: String,
        #[source]
        source: RegionError,
    },

    #[error("cannot bind channel at {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ─── Producer failures ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ClientError {
    /// Server not running, or the endpoint is stale. Never retried.
    #[error("cannot reach server at {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// One send/receive exchange failed; the producer loop stops.
    #[error("exchange failed: {0}")]
    Exchange(#[from] ProtocolError),
}
