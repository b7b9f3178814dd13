//! Server startup: socket binding, signal handling and the accept loop.

use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use session_runtime::SessionScheduler;

use crate::config::ServerSettings;
use crate::engine::EngineFactory;
use crate::ipc;
use crate::service::SessionService;

/// Bind the socket, replacing a stale one left by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("remove stale socket {:?}", path))?;
    }
    UnixListener::bind(path).with_context(|| format!("bind {:?}", path))
}

/// Serve sessions on `settings.socket_path` until the process is stopped.
pub fn run_server(
    settings: ServerSettings,
    factory: Arc<dyn EngineFactory>,
    install_ctrlc: bool,
) -> Result<()> {
    let listener = bind(&settings.socket_path)?;
    if install_ctrlc {
        let socket_for_signal = settings.socket_path.clone();
        let _ = ctrlc::set_handler(move || {
            let _ = std::fs::remove_file(&socket_for_signal);
            std::process::exit(130);
        });
    }

    let scheduler =
        Arc::new(SessionScheduler::start("session-scheduler").context("start scheduler")?);
    let service = Arc::new(SessionService::new(scheduler, factory, settings.service));
    tracing::info!(
        socket = ?settings.socket_path,
        max_sessions = settings.service.max_sessions,
        "listening"
    );
    ipc::serve(listener, service)
}
