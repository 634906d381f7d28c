//! Detach from the controlling terminal.
//!
//! Classic double fork: the first child starts a new session, the second
//! child can never reacquire a terminal. Only the grandchild continues;
//! both ancestors report `Fork::Parent` and should exit with status 0.
//!
//! Must run before any thread (including the async runtime) is started.
//! Open descriptors other than stdio are inherited, which is how the bound
//! listening socket reaches the daemon.

use std::io;
use tracing::debug;

/// Which side of the fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// Original process or intermediate child; should exit.
    Parent,
    /// The detached daemon.
    Child,
}

/// Fork twice, start a new session, reset umask and cwd, and point stdio at `/dev/null`.
pub fn daemonize() -> io::Result<Fork> {
    if fork()? == Fork::Parent {
        return Ok(Fork::Parent);
    }

    // SAFETY: setsid has no preconditions; failure is reported via errno.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    if fork()? == Fork::Parent {
        return Ok(Fork::Parent);
    }

    // SAFETY: umask and chdir only touch process state; the path is a valid C string.
    unsafe {
        libc::umask(0);
        if libc::chdir(c"/".as_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    redirect_stdio()?;
    debug!(pid = std::process::id(), "Daemonized");
    Ok(Fork::Child)
}

fn fork() -> io::Result<Fork> {
    // SAFETY: called before any other thread exists, so the child starts
    // with a consistent copy of the process.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        _ => Ok(Fork::Parent),
    }
}

fn redirect_stdio() -> io::Result<()> {
    // SAFETY: the path is a valid C string and the returned descriptor is
    // checked before use.
    let null = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
    if null < 0 {
        return Err(io::Error::last_os_error());
    }

    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open.
        if unsafe { libc::dup2(null, fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if null > libc::STDERR_FILENO {
        // SAFETY: `null` is open and no longer needed.
        unsafe { libc::close(null) };
    }
    Ok(())
}
