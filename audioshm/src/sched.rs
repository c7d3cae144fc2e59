use std::io;

use tracing::{info, warn};

/// Moves the calling process to SCHED_FIFO at `priority`. A priority of 0 leaves the
/// scheduling class alone.
///
/// Failure (usually a missing CAP_SYS_NICE or rtprio limit) is logged and returned,
/// callers keep running at normal priority.
pub fn set_realtime(priority: i32) -> io::Result<()> {
    if priority <= 0 {
        return Ok(());
    }
    let result = apply(priority);
    match &result {
        Ok(()) => info!(priority, "running with SCHED_FIFO"),
        Err(e) => warn!(priority, error = %e, "could not switch to real-time scheduling"),
    }
    result
}

#[cfg(target_os = "linux")]
fn apply(priority: i32) -> io::Result<()> {
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    let min = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
    let param = libc::sched_param {
        sched_priority: priority.clamp(min, max),
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "real-time scheduling is only wired up on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_priority_is_a_no_op() {
        assert!(set_realtime(0).is_ok());
    }
}
