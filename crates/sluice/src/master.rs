use std::{
    io,
    path::Path,
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use sluice_net::{Handler, ListenSock, Server, ServerError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{config::Config, signal};

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("couldn't write pid file {path}: {source}")]
    PidFile { path: String, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Cadence of the master's child-reaping pass.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Master process cycle: open the shared listeners, fork the configured
/// number of workers, then supervise until a shutdown signal arrives.
///
/// Workers never return through here; each one runs its event loop and
/// exits on its own. Returns once every worker is reaped.
pub fn run(cfg: &Config, handler: Arc<dyn Handler>) -> Result<(), RunError> {
    let socks = ListenSock::open_all(&cfg.listen_ports)?;
    write_pid_file(&cfg.pid_file)?;

    let quit = Arc::new(AtomicBool::new(false));
    signal::register_quit(&quit)?;

    let mut children: Vec<libc::pid_t> = Vec::with_capacity(cfg.worker_processes);
    for i in 0..cfg.worker_processes {
        match unsafe { libc::fork() } {
            -1 => {
                error!(worker = i, "fork failed: {}", io::Error::last_os_error());
                break;
            }
            0 => {
                let code = match worker_cycle(
                    cfg,
                    &socks,
                    Arc::clone(&handler),
                    Arc::clone(&quit),
                ) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(%e, "worker failed");
                        1
                    }
                };
                process::exit(code);
            }
            pid => children.push(pid),
        }
    }
    if children.is_empty() {
        let _ = std::fs::remove_file(&cfg.pid_file);
        return Err(RunError::Io(io::Error::other("couldn't fork any worker")));
    }

    info!(workers = children.len(), pid = process::id(), "master supervising");
    while !quit.load(Ordering::Relaxed) {
        reap(&mut children);
        if children.is_empty() {
            warn!("all workers exited");
            break;
        }
        thread::sleep(REAP_INTERVAL);
    }

    for &pid in &children {
        unsafe { libc::kill(pid, libc::SIGTERM) };
    }
    for pid in children {
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }
    let _ = std::fs::remove_file(&cfg.pid_file);
    info!("master shutdown complete");
    Ok(())
}

/// Worker process body: build the engine around the inherited listener
/// fds, run the reactor until the quit flag flips, tear down.
fn worker_cycle(
    cfg: &Config,
    socks: &[ListenSock],
    handler: Arc<dyn Handler>,
    quit: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    let mut server = Server::bind(&cfg.engine(), socks, handler, quit)?;
    info!(pid = process::id(), "worker online");
    server.run()?;
    server.shutdown();
    Ok(())
}

fn reap(children: &mut Vec<libc::pid_t>) {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        warn!(pid, status, "worker exited");
        children.retain(|&p| p != pid);
    }
}

fn write_pid_file(path: &Path) -> Result<(), RunError> {
    std::fs::write(path, format!("{}\n", process::id()))
        .map_err(|source| RunError::PidFile { path: path.display().to_string(), source })
}
