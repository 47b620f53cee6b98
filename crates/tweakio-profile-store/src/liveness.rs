//! Process liveness probing for stale lock detection.

use std::fmt;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Decides whether a recorded lock holder is still running.
pub trait LivenessProbe: Send + Sync + fmt::Debug {
    /// Whether `pid` names a running process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the OS process table.
///
/// The calling process always counts as alive. Zombies and dead entries
/// count as not running.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl LivenessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == std::process::id() {
            return true;
        }
        if pid == 0 {
            return false;
        }

        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        system
            .process(pid)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(SystemProbe.is_alive(std::process::id()));
    }

    #[test]
    fn test_unused_pid_is_dead() {
        assert!(!SystemProbe.is_alive(0x7FFF_FFF0));
        assert!(!SystemProbe.is_alive(0));
    }

    #[test]
    fn test_child_process_liveness() {
        let mut child = match std::process::Command::new("sleep").arg("5").spawn() {
            Ok(child) => child,
            Err(_) => return,
        };
        let pid = child.id();
        assert!(SystemProbe.is_alive(pid));

        child.kill().expect("kill child");
        child.wait().expect("reap child");
        assert!(!SystemProbe.is_alive(pid));
    }
}
