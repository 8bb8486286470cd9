use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{pending::PendingError, EnvelopeError};

#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing is accepting requests; starting the engine may help.
    #[error("no engine is listening")]
    NoListener,

    #[error("engine closed the connection")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Sorts connection errors into "nobody listening" and everything else.
    pub fn from_connect(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => Self::NoListener,
            _ => Self::Io(err),
        }
    }

    /// Sorts write errors on a fresh connection: a peer that hung up means
    /// the engine went away.
    pub fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => Self::NoListener,
            _ => Self::from_connect(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Pending(#[from] PendingError),

    #[error("reply dispatcher has stopped")]
    DispatcherGone,

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to start {}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no reply within {after:?}")]
    Timeout { after: Duration },

    /// The engine received the task but could not run it.
    #[error("engine failed the task with status {status}")]
    Engine { status: u16 },
}

impl ClientError {
    /// Nonzero errno-style code for callers that only pass a number on.
    pub fn status(&self) -> i32 {
        match self {
            Self::Pending(_) => libc::EBUSY,
            Self::DispatcherGone => libc::ECANCELED,
            Self::Envelope(_) => libc::EINVAL,
            Self::Transport(TransportError::NoListener) => libc::ESRCH,
            Self::Transport(_) => libc::EIO,
            Self::Spawn { .. } => libc::ECHILD,
            Self::Timeout { .. } => libc::ETIMEDOUT,
            Self::Engine { status } => i32::from(*status).max(1),
        }
    }
}
