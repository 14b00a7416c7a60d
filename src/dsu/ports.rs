//! Recovery of a DSU port left bound by a crashed prior instance.
//!
//! Best-effort by design: we only ever terminate a process we can positively
//! identify as another gcbridge. Anything ambiguous is reported and left
//! alone.

use std::process::Command;
use tracing::{info, warn};

/// Substring that must appear in the owner's command line before we touch it.
const OWN_PROCESS_MARKER: &str = "gcbridge";

/// Returns the PID holding `port` for UDP, if any.
pub fn port_owner_pid(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .args(["-ti", &format!("udp:{port}")])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}

fn pid_command_line(pid: u32) -> Option<String> {
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let command = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!command.is_empty()).then_some(command)
}

/// Frees `port` if it is held by a verifiable prior instance of this tool.
/// Returns whether a process was terminated.
pub fn free_orphaned_port(port: u16) -> bool {
    let Some(pid) = port_owner_pid(port) else {
        info!("port {port} is not in use, nothing to free");
        return false;
    };
    if pid == std::process::id() {
        info!("port {port} is held by this process");
        return false;
    }
    let Some(command) = pid_command_line(pid) else {
        warn!("port {port} is held by pid {pid}, but its identity could not be read");
        return false;
    };
    if !command.contains(OWN_PROCESS_MARKER) {
        warn!("port {port} is held by pid {pid} ({command}); refusing to terminate a foreign process");
        return false;
    }

    match Command::new("kill").arg(pid.to_string()).status() {
        Ok(status) if status.success() => {
            info!("freed port {port} (terminated stale instance, pid {pid})");
            true
        }
        Ok(status) => {
            warn!("kill {pid} exited with {status}");
            false
        }
        Err(e) => {
            warn!("could not run kill for pid {pid}: {e}");
            false
        }
    }
}
