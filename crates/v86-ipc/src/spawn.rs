//! Starting the engine process on demand.

use std::{future::Future, path::PathBuf, process::Stdio};

use tokio::process::Command;
use tracing::{info, warn};

use crate::ClientError;

/// Starts an engine that will listen on the caller's channel.
pub trait HelperSpawner: Send + Sync + 'static {
    fn spawn(&self) -> impl Future<Output = Result<(), ClientError>> + Send;
}

/// Runs the helper binary with no arguments and a minimal environment, and
/// waits for it to exit.
///
/// The engine binds its socket before it detaches, so once the launched
/// process has exited the engine is already listening.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    path: PathBuf,
}

impl CommandSpawner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl HelperSpawner for CommandSpawner {
    async fn spawn(&self) -> Result<(), ClientError> {
        info!(path = %self.path.display(), "starting engine helper");
        let status = Command::new(&self.path)
            .env_clear()
            .env("HOME", "/")
            .env("PATH", "/sbin:/bin")
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| ClientError::Spawn {
                path: self.path.clone(),
                source,
            })?;
        if !status.success() {
            warn!(path = %self.path.display(), %status, "engine helper exited unsuccessfully");
        }
        Ok(())
    }
}

/// `None` disables on-demand start: the resend simply fails again.
impl<S: HelperSpawner> HelperSpawner for Option<S> {
    async fn spawn(&self) -> Result<(), ClientError> {
        match self {
            Some(spawner) => spawner.spawn().await,
            None => Ok(()),
        }
    }
}
