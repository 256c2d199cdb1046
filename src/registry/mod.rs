//! Process registry: one `/proc` sweep per sampling window.
//!
//! The snapshot never fails as a whole. Individual processes race with the
//! sweep and vanish between `readdir` and the per-file reads; those are
//! dropped silently at debug level. When `/proc` itself is unreadable the
//! snapshot is empty and the window proceeds degraded (the scheduler treats
//! it as a no-op window, not a shutdown).

pub mod containers;

use std::fs;
use std::path::PathBuf;

use crate::domain::{Pid, ProcessDescriptor, RuntimeKind};
use crate::procview;

/// Snapshot all processes visible from the host pid namespace.
///
/// Runtime kind and appid are left at their defaults; the classifier and
/// application identifier annotate descriptors after the snapshot.
#[must_use]
pub fn snapshot() -> Vec<ProcessDescriptor> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("/proc is unavailable ({e}); producing an empty snapshot");
            return Vec::new();
        }
    };

    let mut descriptors = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        match read_descriptor(Pid(pid)) {
            Ok(desc) => descriptors.push(desc),
            Err(e) => {
                // Expected for processes that exited mid-sweep.
                log::debug!("skipping pid {pid}: {e}");
            }
        }
    }
    descriptors
}

fn read_descriptor(pid: Pid) -> std::io::Result<ProcessDescriptor> {
    let stat = procview::read_stat(pid)?;
    // comm is attacker-controlled text that ends up in artifact lines;
    // strip the two characters that would corrupt the folded format.
    let comm = stat.comm.replace(['\n', '\r'], " ").replace(';', ",");
    let cmdline = procview::read_cmdline(pid).unwrap_or_default();
    // Kernel threads and permission-restricted processes have no readable
    // exe link; they remain plain native targets.
    let exe_path = procview::read_exe(pid).unwrap_or_else(|_| PathBuf::new());
    let module_sonames = procview::read_module_sonames(pid).unwrap_or_default();
    let container_id = procview::read_cgroup(pid)
        .map(|content| containers::container_id_from_cgroup(&content))
        .unwrap_or_default();
    let pid_ns = procview::read_ns_id(pid, "pid").ok();
    let mnt_ns = procview::read_ns_id(pid, "mnt").ok();

    Ok(ProcessDescriptor {
        pid,
        ppid: stat.ppid,
        start_time: stat.start_time,
        comm,
        cmdline,
        exe_path,
        module_sonames,
        container_id,
        pid_ns,
        mnt_ns,
        runtime: RuntimeKind::Native,
        runtime_version: None,
        appid: String::new(),
    })
}
