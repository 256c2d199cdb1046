//! Read-only views into `/proc` for live processes.
//!
//! All target-owned paths are resolved through `/proc/<pid>/root`, which
//! crosses into the process's mount namespace without `setns(2)`. Reads stay
//! plain file operations, so no worker ever holds state across a namespace
//! switch.
//!
//! Processes vanish at any time; every function here returns `io::Result`
//! and callers are expected to drop vanished entries silently.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::{Pid, StartTimeToken};

/// Fields parsed from `/proc/<pid>/stat`.
#[derive(Debug, Clone)]
pub struct StatFields {
    pub comm: String,
    pub ppid: Pid,
    /// Field 22: process start time, clock ticks since boot. Used as the
    /// pid-reuse token.
    pub start_time: StartTimeToken,
}

fn proc_dir(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}"))
}

/// Root of the process's mount-namespace view.
#[must_use]
pub fn proc_root(pid: Pid) -> PathBuf {
    proc_dir(pid).join("root")
}

/// Resolve an absolute path inside the target's mount namespace to a path
/// readable from the host.
#[must_use]
pub fn host_path(pid: Pid, target_path: &Path) -> PathBuf {
    let relative = target_path.strip_prefix("/").unwrap_or(target_path);
    proc_root(pid).join(relative)
}

/// Parse `/proc/<pid>/stat`.
///
/// The comm field is parenthesized and may itself contain parentheses, so
/// the parse anchors on the first `(` and the last `)`.
pub fn read_stat(pid: Pid) -> io::Result<StatFields> {
    let content = fs::read_to_string(proc_dir(pid).join("stat"))?;
    parse_stat(&content).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("malformed stat for pid {pid}"))
    })
}

fn parse_stat(content: &str) -> Option<StatFields> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if open >= close {
        return None;
    }
    let comm = content[open + 1..close].to_string();

    // Fields after the comm: state ppid pgrp ... starttime is field 22
    // overall, i.e. index 19 within the post-comm fields.
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let ppid = rest.get(1)?.parse::<u32>().ok()?;
    let start_time = rest.get(19)?.parse::<u64>().ok()?;

    Some(StatFields { comm, ppid: Pid(ppid), start_time: StartTimeToken(start_time) })
}

/// Read the NUL-separated command line. Kernel threads yield an empty vec.
pub fn read_cmdline(pid: Pid) -> io::Result<Vec<String>> {
    let raw = fs::read(proc_dir(pid).join("cmdline"))?;
    Ok(raw
        .split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect())
}

/// Resolve the executable path via the `/proc/<pid>/exe` symlink.
pub fn read_exe(pid: Pid) -> io::Result<PathBuf> {
    fs::read_link(proc_dir(pid).join("exe"))
}

/// Unique basenames of file-backed mappings from `/proc/<pid>/maps`,
/// in first-seen order. Used for runtime detection (libjvm, libpython, ...).
pub fn read_module_sonames(pid: Pid) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(proc_dir(pid).join("maps"))?;
    let mut seen = Vec::new();
    for line in content.lines() {
        // maps line: addr perms offset dev inode [pathname]
        let Some(path) = line.splitn(6, ' ').nth(5).map(str::trim) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }
        let Some(base) = Path::new(path).file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !seen.iter().any(|s| s == base) {
            seen.push(base.to_string());
        }
    }
    Ok(seen)
}

/// Namespace id from `/proc/<pid>/ns/<kind>`, e.g. `pid:[4026531836]`.
pub fn read_ns_id(pid: Pid, kind: &str) -> io::Result<u64> {
    let link = fs::read_link(proc_dir(pid).join("ns").join(kind))?;
    let text = link.to_string_lossy();
    parse_ns_link(&text).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("malformed ns link {text:?}"))
    })
}

fn parse_ns_link(text: &str) -> Option<u64> {
    let open = text.find('[')?;
    let close = text.rfind(']')?;
    text.get(open + 1..close)?.parse().ok()
}

/// Read the cgroup membership lines for a process.
pub fn read_cgroup(pid: Pid) -> io::Result<String> {
    fs::read_to_string(proc_dir(pid).join("cgroup"))
}

/// The process's pid as seen inside its own pid namespace, from the
/// `NSpid:` line of `/proc/<pid>/status` (last value, innermost ns).
pub fn read_nspid(pid: Pid) -> io::Result<u32> {
    let status = fs::read_to_string(proc_dir(pid).join("status"))?;
    parse_nspid(&status).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("no NSpid line for pid {pid}"))
    })
}

fn parse_nspid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .and_then(|rest| rest.split_whitespace().last())
        .and_then(|last| last.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_pid() -> Pid {
        Pid(std::process::id())
    }

    #[test]
    fn test_parse_stat_plain() {
        let stat = "1234 (myapp) S 1 1234 1234 0 -1 4194304 100 0 0 0 5 3 0 0 20 0 4 0 98765 1000000 250";
        let fields = parse_stat(stat).unwrap();
        assert_eq!(fields.comm, "myapp");
        assert_eq!(fields.ppid, Pid(1));
        assert_eq!(fields.start_time, StartTimeToken(98765));
    }

    #[test]
    fn test_parse_stat_comm_with_parens() {
        // comm may contain parentheses and spaces
        let stat = "99 (app (v2) x) R 7 99 99 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 42 0 0";
        let fields = parse_stat(stat).unwrap();
        assert_eq!(fields.comm, "app (v2) x");
        assert_eq!(fields.ppid, Pid(7));
        assert_eq!(fields.start_time, StartTimeToken(42));
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("1234 (x) S 1").is_none());
        assert!(parse_stat("no parens here").is_none());
    }

    #[test]
    fn test_parse_ns_link() {
        assert_eq!(parse_ns_link("pid:[4026531836]"), Some(4_026_531_836));
        assert_eq!(parse_ns_link("mnt:[1]"), Some(1));
        assert_eq!(parse_ns_link("garbage"), None);
    }

    #[test]
    fn test_read_self_stat() {
        let fields = read_stat(self_pid()).unwrap();
        assert!(!fields.comm.is_empty());
        assert!(fields.start_time.0 > 0);
    }

    #[test]
    fn test_read_self_cmdline_and_exe() {
        assert!(!read_cmdline(self_pid()).unwrap().is_empty());
        assert!(read_exe(self_pid()).unwrap().is_absolute());
    }

    #[test]
    fn test_host_path_resolution() {
        let path = host_path(Pid(42), Path::new("/usr/bin/python3"));
        assert_eq!(path, PathBuf::from("/proc/42/root/usr/bin/python3"));
    }

    #[test]
    fn test_vanished_process_is_io_error() {
        assert!(read_stat(Pid(4_000_000)).is_err());
    }

    #[test]
    fn test_parse_nspid() {
        let status = "Name:\tjava\nPid:\t1234\nNSpid:\t1234\t1\nThreads:\t20\n";
        assert_eq!(parse_nspid(status), Some(1));
        assert_eq!(parse_nspid("Name:\tjava\nNSpid:\t77\n"), Some(77));
        assert_eq!(parse_nspid("Name:\tjava\n"), None);
    }

    #[test]
    fn test_read_self_nspid() {
        // The test process runs in some pid namespace; its nspid is valid.
        assert!(read_nspid(self_pid()).unwrap() > 0);
    }
}
