//! Signalling pipeline processes by pid.
//!
//! Every pipeline leads its own process group, so its pid is also the group id.

#[cfg(unix)]
fn signal_zero(target: libc::pid_t) -> bool {
    // SAFETY: signal 0 performs the existence and permission checks without delivering anything.
    if unsafe { libc::kill(target, 0) } == 0 {
        return true;
    }
    // EPERM: the target exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => signal_zero(pid),
        _ => false,
    }
}

/// Whether any member of the process group led by `pgid` is still running.
#[cfg(unix)]
pub(crate) fn process_group_alive(pgid: u32) -> bool {
    match libc::pid_t::try_from(pgid) {
        Ok(pgid) if pgid > 1 => signal_zero(-pgid),
        _ => false,
    }
}

#[cfg(unix)]
pub(crate) fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: killpg only signals; the group id comes from a child we spawned.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(not(unix))]
pub(crate) fn process_group_alive(_pgid: u32) -> bool {
    false
}
