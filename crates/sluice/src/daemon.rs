use std::{fs::OpenOptions, io, os::fd::AsRawFd};

pub enum Daemon {
    Parent,
    Child,
}

/// One-shot pre-fork daemonization.
///
/// The caller exits on `Parent`. The `Child` comes back as a session
/// leader detached from the controlling terminal, with stdin and stdout on
/// `/dev/null`. stderr is left attached so startup failures stay visible
/// until the log sink takes over.
pub fn daemonize() -> io::Result<Daemon> {
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => return Ok(Daemon::Parent),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::umask(0) };

    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO] {
        if unsafe { libc::dup2(null.as_raw_fd(), target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(Daemon::Child)
}
