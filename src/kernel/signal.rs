//! Termination signals for agent process groups.

/// Send `SIGTERM` to the process group led by `pid`.
///
/// Agents are launched as group leaders, so this also reaches anything the
/// agent forked.
///
/// # Errors
///
/// Returns the OS error, e.g. `ESRCH` when the group is already gone.
#[cfg(unix)]
pub fn terminate_group(pid: u32) -> std::io::Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Send `SIGKILL` to the process group led by `pid`.
///
/// # Errors
///
/// Returns the OS error, e.g. `ESRCH` when the group is already gone.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> std::io::Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    killpg(Pid::from_raw(raw), signal).map_err(std::io::Error::from)
}

/// Process-group signals are unavailable off Unix.
///
/// # Errors
///
/// Always returns `ErrorKind::Unsupported`.
#[cfg(not(unix))]
pub fn terminate_group(_pid: u32) -> std::io::Result<()> {
    Err(unsupported())
}

/// Process-group signals are unavailable off Unix.
///
/// # Errors
///
/// Always returns `ErrorKind::Unsupported`.
#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> std::io::Result<()> {
    Err(unsupported())
}

#[cfg(not(unix))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process-group signals require unix",
    )
}
