//! Detaching from the invoking remote session
//!
//! Must run before the async runtime starts: forking a process that already
//! owns runtime threads leaves the child with a single thread and stale locks.

use std::ffi::CStr;
use std::io;

const DEV_NULL: &CStr = c"/dev/null";

/// Double fork into a new session with stdio pointed at `/dev/null`.
///
/// Returns in the grandchild only; both ancestors exit immediately.
pub fn detach() -> io::Result<()> {
    fork_and_exit_parent()?;

    // SAFETY: plain syscall, no Rust state is shared with other threads yet.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    fork_and_exit_parent()?;
    redirect_stdio()
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: called while the process is still single threaded.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        // SAFETY: _exit skips atexit handlers and stdio flushing owned by the child.
        _ => unsafe { libc::_exit(0) },
    }
}

fn redirect_stdio() -> io::Result<()> {
    // SAFETY: DEV_NULL is a valid NUL terminated path.
    let null = unsafe { libc::open(DEV_NULL.as_ptr(), libc::O_RDWR) };
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
        // SAFETY: `null` is owned here and no longer needed.
        unsafe { libc::close(null) };
    }
    Ok(())
}
