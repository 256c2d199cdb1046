//! Container identity from cgroup membership.
//!
//! The container id is extracted from `/proc/<pid>/cgroup` path segments.
//! Docker, containerd, CRI-O and kubepods layouts all embed a 64-hex-digit
//! container id somewhere in the path; systemd-managed runtimes wrap it in a
//! `<runtime>-<id>.scope` unit name.

/// Recognized systemd scope prefixes carrying a container id.
const SCOPE_PREFIXES: &[&str] = &["docker-", "cri-containerd-", "crio-", "libpod-"];

const CONTAINER_ID_LENGTH: usize = 64;

fn is_container_id(text: &str) -> bool {
    text.len() == CONTAINER_ID_LENGTH && text.bytes().all(|b| b.is_ascii_hexdigit())
}

fn id_from_segment(segment: &str) -> Option<&str> {
    if is_container_id(segment) {
        return Some(segment);
    }
    // systemd scope form: docker-<id>.scope
    let unit = segment.strip_suffix(".scope")?;
    for prefix in SCOPE_PREFIXES {
        if let Some(id) = unit.strip_prefix(prefix) {
            if is_container_id(id) {
                return Some(id);
            }
        }
    }
    None
}

/// Extract the container id from `/proc/<pid>/cgroup` content.
///
/// Returns an empty string for processes that are not in a container; an
/// empty container identity is the documented "host process" signal.
#[must_use]
pub fn container_id_from_cgroup(content: &str) -> String {
    for line in content.lines() {
        // Line format: hierarchy-ID:controller-list:cgroup-path
        let Some(path) = line.splitn(3, ':').nth(2) else {
            continue;
        };
        for segment in path.split('/') {
            if let Some(id) = id_from_segment(segment) {
                return id.to_string();
            }
        }
    }
    String::new()
}
