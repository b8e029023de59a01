//! Unmount helpers for kernel transport mounts.

use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

/// Ask the OS to detach a kernel transport mount.
///
/// Returns `true` once the mount point is no longer mounted, including when
/// it was never mounted to begin with.
pub fn unmount(mountpoint: &Path) -> bool {
    let mountpoint_str = mountpoint.to_string_lossy();
    if cfg!(target_os = "linux") && !is_mounted(mountpoint) {
        debug!(mountpoint = %mountpoint_str, "Already unmounted, skipping fusermount");
        return true;
    }
    if cfg!(target_os = "macos") {
        return run_unmount_command("umount", &[mountpoint_str.as_ref()], &mountpoint_str);
    }
    run_fusermount(&mountpoint_str)
}

/// Run `fusermount3 -u`, falling back to `fusermount -u`.
fn run_fusermount(mountpoint: &str) -> bool {
    let args = ["-u", mountpoint];
    let result = Command::new("fusermount3")
        .args(args)
        .output()
        .or_else(|_| Command::new("fusermount").args(args).output());
    interpret(result, "fusermount", mountpoint)
}

fn run_unmount_command(program: &str, args: &[&str], mountpoint: &str) -> bool {
    interpret(Command::new(program).args(args).output(), program, mountpoint)
}

fn interpret(
    result: std::io::Result<std::process::Output>,
    program: &str,
    mountpoint: &str,
) -> bool {
    match result {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already gone counts as success
            if stderr.contains("not found") || stderr.contains("not mounted") {
                true
            } else {
                debug!(
                    mountpoint = %mountpoint,
                    program,
                    stderr = %stderr,
                    "Unmount command failed"
                );
                false
            }
        }
        Err(e) => {
            warn!(mountpoint = %mountpoint, program, error = %e, "Failed to run unmount command");
            false
        }
    }
}

/// Whether `path` appears as a mount point in `/proc/mounts`.
///
/// Always `false` where `/proc/mounts` does not exist.
pub fn is_mounted(path: &Path) -> bool {
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts_contain(&mounts, path),
        Err(_) => false,
    }
}

fn mounts_contain(mounts: &str, path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.nth(1).map(unescape_mount_field).as_deref() == Some(path_str.as_ref())
    })
}

/// `/proc/mounts` escapes space, tab, newline and backslash as octal.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}
