//! Per-process runtime classification.
//!
//! Rules are ordered cheap-to-expensive and first-match wins. Classification
//! only looks at data the registry already captured (executable basename and
//! mapped shared-object names) — it never spawns children and never touches
//! the target process.

use crate::domain::{ProcessDescriptor, RuntimeKind};

/// Shared objects identifying a .NET runtime.
const DOTNET_SONAMES: &[&str] = &["libcoreclr.so", "libclrjit.so", "libhostpolicy.so"];

/// Classify one process descriptor.
///
/// Returns the runtime kind and, when derivable without touching the
/// process, the runtime version.
#[must_use]
pub fn classify(desc: &ProcessDescriptor) -> (RuntimeKind, Option<String>) {
    let exe = desc.exe_basename();

    // libjvm.so carries no version in its soname, so Java stays unversioned.
    if find_soname(desc, "libjvm").is_some() {
        return (RuntimeKind::Java, None);
    }

    if exe.starts_with("python") || find_soname(desc, "libpython").is_some() {
        let version = find_soname(desc, "libpython").and_then(|s| version_from_soname(s, "libpython"));
        return (RuntimeKind::Python, version);
    }

    if exe.starts_with("ruby") || find_soname(desc, "libruby").is_some() {
        let version = find_soname(desc, "libruby").and_then(|s| version_from_soname(s, "libruby"));
        return (RuntimeKind::Ruby, version);
    }

    if exe.starts_with("php-fpm") || exe.starts_with("php") {
        return (RuntimeKind::Php, None);
    }

    if exe == "node" || exe == "nodejs" {
        return (RuntimeKind::Node, None);
    }

    if DOTNET_SONAMES.iter().any(|so| desc.module_sonames.iter().any(|m| m == so)) {
        return (RuntimeKind::DotNet, None);
    }

    (RuntimeKind::Native, None)
}

/// Annotate a snapshot in place with runtime kind and version.
pub fn annotate(descriptors: &mut [ProcessDescriptor]) {
    for desc in descriptors {
        let (runtime, version) = classify(desc);
        desc.runtime = runtime;
        desc.runtime_version = version;
    }
}

fn find_soname<'a>(desc: &'a ProcessDescriptor, prefix: &str) -> Option<&'a str> {
    desc.module_sonames.iter().map(String::as_str).find(|name| name.starts_with(prefix))
}

/// Pull a `MAJOR.MINOR` version out of sonames like `libpython3.11.so.1.0`
/// or `libruby.so.3.0.5`.
fn version_from_soname(soname: &str, lib: &str) -> Option<String> {
    let rest = soname.strip_prefix(lib)?;
    // Either the version follows the lib name directly (libpython3.11.so)
    // or it trails the .so suffix (libruby.so.3.0.5).
    let candidate = if rest.starts_with(".so.") {
        &rest[".so.".len()..]
    } else {
        rest.split(".so").next().unwrap_or("")
    };

    let mut parts = candidate.split('.');
    let major = parts.next().filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))?;
    let minor = parts.next().filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))?;
    Some(format!("{major}.{minor}"))
}
