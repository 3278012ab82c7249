use std::{
    io,
    sync::{Arc, atomic::AtomicBool},
};

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};

/// Flips `flag` on any shutdown signal.
///
/// Registered in the master before fork, so every worker inherits the
/// disposition and each process observes its own copy of the flag.
pub fn register_quit(flag: &Arc<AtomicBool>) -> io::Result<()> {
    for sig in [SIGTERM, SIGINT, SIGQUIT] {
        signal_hook::flag::register(sig, Arc::clone(flag))?;
    }
    Ok(())
}
