//! Per-daemon bookkeeping files (spec.md §6 "Daemon bookkeeping files"):
//! a pid file, and one sidecar per active non-socket transport recording
//! `host:port`. All are removed on graceful stop.

use std::io;
use std::path::PathBuf;

fn base_path(name: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/nerve-{name}.{suffix}"))
}

pub fn pid_path(name: &str) -> PathBuf {
    base_path(name, "pid")
}

pub fn socket_path(name: &str) -> PathBuf {
    base_path(name, "sock")
}

pub fn tcp_sidecar_path(name: &str) -> PathBuf {
    base_path(name, "tcp")
}

pub fn http_sidecar_path(name: &str) -> PathBuf {
    base_path(name, "http")
}

pub fn write_pid_file(name: &str) -> io::Result<()> {
    std::fs::write(pid_path(name), std::process::id().to_string())
}

pub fn write_tcp_sidecar(name: &str, addr: &str) -> io::Result<()> {
    std::fs::write(tcp_sidecar_path(name), addr)
}

pub fn write_http_sidecar(name: &str, addr: &str) -> io::Result<()> {
    std::fs::write(http_sidecar_path(name), addr)
}

/// Checks whether a daemon of this name is already running. A stale pid
/// file (process gone but file left behind, e.g. after a crash) reads as
/// "not running" — `/proc/<pid>` existing is the liveness check on Linux;
/// elsewhere this degrades to "pid file present" (spec.md §6 exit codes:
/// "start exits non-zero when a daemon of the same name is already running").
pub fn is_running(name: &str) -> bool {
    let Ok(contents) = std::fs::read_to_string(pid_path(name)) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    process_alive(pid)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Removes the pid file and any transport sidecars. Idempotent.
pub fn cleanup(name: &str) {
    for path in [pid_path(name), socket_path(name), tcp_sidecar_path(name), http_sidecar_path(name)] {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_namespaced_by_name() {
        assert_eq!(pid_path("alpha"), PathBuf::from("/tmp/nerve-alpha.pid"));
        assert_eq!(socket_path("alpha"), PathBuf::from("/tmp/nerve-alpha.sock"));
    }

    #[test]
    fn not_running_when_no_pid_file() {
        assert!(!is_running("nerve-bookkeeping-test-nonexistent"));
    }

    #[test]
    fn cleanup_removes_written_files() {
        let name = "nerve-bookkeeping-test-cleanup";
        write_pid_file(name).unwrap();
        write_tcp_sidecar(name, "127.0.0.1:9999").unwrap();
        assert!(pid_path(name).exists());
        cleanup(name);
        assert!(!pid_path(name).exists());
        assert!(!tcp_sidecar_path(name).exists());
    }
}
