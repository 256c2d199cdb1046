//! Host metadata attached to every artifact preamble.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HostMetadata {
    pub hostname: String,
    pub kernel_release: String,
    pub cpu_count: usize,
    pub agent_version: String,
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Collect host facts once at startup; none of these change mid-run.
#[must_use]
pub fn collect() -> HostMetadata {
    HostMetadata {
        hostname: read_trimmed("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".into()),
        kernel_release: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
        cpu_count: std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
