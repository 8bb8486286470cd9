//! The engine process: socket setup, detaching and the serve loop.

use std::{
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
};

use anyhow::{bail, Context};
use tracing::{debug, info, warn};
use v86_cpu::{
    Backend, BackendError, BackendKind, EmulatorBackend, HostPorts, LibraryBackend, TrapBackend,
};
use v86_ipc::{accept_unix, ChannelId, Envelope, ServeExit, Server, Transport, UnixTransport};
use v86_mem::{HostLayout, Placement};
use v86_task::{Engine, Task};

use crate::Config;

/// Builds the configured execution backend over host memory.
pub fn open_backend(config: &Config) -> Result<Backend, BackendError> {
    let ports = HostPorts::acquire()?;
    let layout = HostLayout::new(&config.mem_device).block_capacity(config.scratch_blocks);
    let backend = match config.backend {
        BackendKind::Emulator => Backend::Emulator(
            EmulatorBackend::new(layout.map()?, ports)?.with_step_budget(config.step_budget),
        ),
        BackendKind::Trap => {
            let memory = layout.placement(Placement::Identity).map()?;
            Backend::Trap(TrapBackend::new(memory, ports)?)
        }
        BackendKind::Library => Backend::Library(LibraryBackend::new(ports)?),
    };
    info!(backend = %config.backend, "execution backend ready");
    Ok(backend)
}

/// Binds the engine socket, replacing a stale socket file left by an
/// engine that is no longer running.
pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                bail!("an engine is already listening on {}", path.display());
            }
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            UnixListener::bind(path)
                .with_context(|| format!("failed to bind {}", path.display()))
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind {}", path.display())),
    }
}

/// Forks into the background. The parent exits at once; the child starts
/// a new session rooted at `/`.
///
/// Must run before any other thread exists.
fn detach() -> anyhow::Result<()> {
    // SAFETY: the process is still single-threaded.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()).context("fork failed"),
        0 => {
            // SAFETY: plain syscall in the child.
            if unsafe { libc::setsid() } == -1 {
                warn!("setsid failed: {}", io::Error::last_os_error());
            }
            std::env::set_current_dir("/").context("chdir to / failed")?;
            Ok(())
        }
        // SAFETY: the parent owns nothing that needs unwinding.
        _ => unsafe { libc::_exit(0) },
    }
}

/// Runs the engine until a signal, an exit task or a fatal error.
///
/// The socket is bound before detaching, so whoever started the engine can
/// connect as soon as the foreground process has exited.
pub fn serve(config: &Config) -> anyhow::Result<()> {
    let listener = bind(&config.socket)?;
    if !config.foreground {
        detach()?;
    }

    let backend = open_backend(config).context("failed to initialise execution backend")?;
    let mut server = Server::new(Engine::new(backend), ChannelId::V86D);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    let exit = runtime.block_on(async {
        listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(listener)?;
        let (requests, accept) = accept_unix(listener);
        info!(socket = %config.socket.display(), "serving BIOS calls");
        let exit = server.run(requests, shutdown_signal()).await;
        accept.abort();
        Ok::<_, io::Error>(exit)
    })?;

    match exit {
        ServeExit::Shutdown => info!("shutdown signal received"),
        ServeExit::ExitTask => info!("stopped by exit task"),
        ServeExit::Disconnected => warn!("listener stopped"),
    }
    if let Err(err) = std::fs::remove_file(&config.socket) {
        debug!(%err, "failed to remove socket");
    }
    Ok(())
}

/// Sends an exit task to the engine listening on the configured socket.
pub fn stop(config: &Config) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(async {
        let frame = Envelope::request(ChannelId::V86D, 0, 0, Task::exit()).encode()?;
        UnixTransport::new(&config.socket)
            .send(frame)
            .await
            .with_context(|| format!("no engine reachable at {}", config.socket.display()))
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v86d.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let _listener = bind(&path).unwrap();
        assert!(UnixStream::connect(&path).is_ok());
    }

    #[test]
    fn bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v86d.sock");
        let _live = UnixListener::bind(&path).unwrap();
        let err = bind(&path).unwrap_err();
        assert!(err.to_string().contains("already listening"));
    }
}
