//! Application identity extraction.
//!
//! Derives a stable, human-readable "appid" label per process from its
//! command line, using per-runtime rules. The appid becomes a root-end label
//! frame in every stack of that process, so flamegraphs split by application
//! rather than by interpreter binary.
//!
//! Rules are first-match-wins within a runtime. A process with no matching
//! rule gets an empty appid and no appid frame.

use std::path::Path;

use crate::domain::{ProcessDescriptor, RuntimeKind};

/// Extract the appid for one process. Empty when no rule matches.
///
/// The returned string never contains `;` or a newline — both would corrupt
/// the folded artifact line.
#[must_use]
pub fn appid(desc: &ProcessDescriptor) -> String {
    let raw = match desc.runtime {
        RuntimeKind::Python => python_appid(&desc.cmdline),
        RuntimeKind::Java => java_appid(&desc.cmdline),
        RuntimeKind::Node => script_appid("node", &desc.cmdline),
        RuntimeKind::Ruby => script_appid("ruby", &desc.cmdline),
        RuntimeKind::DotNet => dotnet_appid(&desc.cmdline),
        _ => None,
    };
    raw.map(|id| sanitize(&id)).unwrap_or_default()
}

/// Annotate a snapshot in place.
pub fn annotate(descriptors: &mut [ProcessDescriptor]) {
    for desc in descriptors {
        desc.appid = appid(desc);
    }
}

fn sanitize(appid: &str) -> String {
    appid.replace(['\n', '\r'], " ").replace(';', ",")
}

/// True for arguments that are interpreter options rather than payload.
fn is_option(arg: &str) -> bool {
    arg.starts_with('-')
}

fn basename(path: &str) -> &str {
    Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path)
}

// ── Python ───────────────────────────────────────────────────────────────

fn python_appid(cmdline: &[String]) -> Option<String> {
    let argv0 = basename(cmdline.first()?);

    // gunicorn master/workers: the WSGI app spec is the identity.
    if let Some(spec) = gunicorn_spec(cmdline) {
        return Some(format!("gunicorn: {spec}"));
    }
    if let Some(spec) = uwsgi_spec(cmdline) {
        return Some(format!("uwsgi: {spec}"));
    }

    if !argv0.starts_with("python") {
        return None;
    }

    // python -m some.module [args]
    if let Some(pos) = cmdline.iter().position(|a| a == "-m") {
        let module = cmdline.get(pos + 1)?;
        return Some(format!("python: -m {module}"));
    }

    // First non-option argument is the script.
    cmdline
        .iter()
        .skip(1)
        .find(|arg| !is_option(arg))
        .map(|script| format!("python: {script}"))
}

fn gunicorn_spec(cmdline: &[String]) -> Option<String> {
    let runs_gunicorn = cmdline
        .iter()
        .take(2)
        .any(|arg| basename(arg) == "gunicorn" || arg.starts_with("gunicorn: "));
    if !runs_gunicorn {
        return None;
    }
    // setproctitle form: "gunicorn: worker [my.wsgi:app]"
    if let Some(first) = cmdline.first() {
        if let Some(open) = first.find('[') {
            if let Some(close) = first.rfind(']') {
                if open < close {
                    return Some(first[open + 1..close].to_string());
                }
            }
        }
    }
    // Plain invocation: the app spec is the last non-option argument.
    cmdline.iter().skip(1).rev().find(|arg| !is_option(arg) && arg.contains(':')).cloned()
}

fn uwsgi_spec(cmdline: &[String]) -> Option<String> {
    if basename(cmdline.first()?) != "uwsgi" {
        return None;
    }
    for (idx, arg) in cmdline.iter().enumerate() {
        if arg == "-w" || arg == "--wsgi-file" || arg == "--module" {
            return cmdline.get(idx + 1).cloned();
        }
        if let Some(value) = arg.strip_prefix("--wsgi-file=").or_else(|| arg.strip_prefix("--module=")) {
            return Some(value.to_string());
        }
    }
    None
}

// ── Java ─────────────────────────────────────────────────────────────────

/// Options that consume the following argument, so the argument after them
/// is not the main class.
const JAVA_VALUE_OPTIONS: &[&str] = &["-cp", "-classpath", "--class-path", "-p", "--module-path"];

fn java_appid(cmdline: &[String]) -> Option<String> {
    let mut args = cmdline.iter().skip(1).peekable();
    while let Some(arg) = args.next() {
        if arg == "-jar" {
            let jar = args.next()?;
            return Some(format!("java: {}", basename(jar)));
        }
        if JAVA_VALUE_OPTIONS.contains(&arg.as_str()) {
            args.next();
            continue;
        }
        if !is_option(arg) {
            // First free-standing argument is the main class.
            return Some(format!("java: {arg}"));
        }
    }
    None
}

// ── Node / Ruby ──────────────────────────────────────────────────────────

fn script_appid(label: &str, cmdline: &[String]) -> Option<String> {
    cmdline
        .iter()
        .skip(1)
        .find(|arg| !is_option(arg))
        .map(|script| format!("{label}: {script}"))
}

// ── .NET ─────────────────────────────────────────────────────────────────

fn dotnet_appid(cmdline: &[String]) -> Option<String> {
    // "dotnet MyService.dll" names the assembly; self-contained apps are
    // identified by the executable itself.
    let argv0 = basename(cmdline.first()?);
    if argv0 == "dotnet" {
        return cmdline
            .iter()
            .skip(1)
            .find(|arg| !is_option(arg))
            .map(|assembly| format!("dotnet: {}", basename(assembly)));
    }
    Some(format!("dotnet: {argv0}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Pid, StartTimeToken};
    use std::path::PathBuf;

    fn descriptor(runtime: RuntimeKind, cmdline: &[&str]) -> ProcessDescriptor {
        ProcessDescriptor {
            pid: Pid(1),
            ppid: Pid(0),
            start_time: StartTimeToken(1),
            comm: String::new(),
            cmdline: cmdline.iter().map(|s| (*s).to_string()).collect(),
            exe_path: PathBuf::new(),
            module_sonames: Vec::new(),
            container_id: String::new(),
            pid_ns: None,
            mnt_ns: None,
            runtime,
            runtime_version: None,
            appid: String::new(),
        }
    }

    #[test]
    fn test_python_script() {
        let desc = descriptor(RuntimeKind::Python, &["/usr/bin/python3", "/srv/app/worker.py"]);
        assert_eq!(appid(&desc), "python: /srv/app/worker.py");
    }

    #[test]
    fn test_python_module() {
        let desc = descriptor(RuntimeKind::Python, &["python3", "-m", "celery.worker"]);
        assert_eq!(appid(&desc), "python: -m celery.worker");
    }

    #[test]
    fn test_python_options_skipped() {
        let desc = descriptor(RuntimeKind::Python, &["python3", "-u", "-O", "serve.py"]);
        assert_eq!(appid(&desc), "python: serve.py");
    }

    #[test]
    fn test_gunicorn_cmdline() {
        let desc = descriptor(
            RuntimeKind::Python,
            &["/usr/bin/python3", "/usr/local/bin/gunicorn", "-w", "4", "my.wsgi:app"],
        );
        assert_eq!(appid(&desc), "gunicorn: my.wsgi:app");
    }

    #[test]
    fn test_gunicorn_proctitle() {
        let desc = descriptor(RuntimeKind::Python, &["gunicorn: worker [my.wsgi:app]"]);
        assert_eq!(appid(&desc), "gunicorn: my.wsgi:app");
    }

    #[test]
    fn test_uwsgi_module() {
        let desc =
            descriptor(RuntimeKind::Python, &["/usr/bin/uwsgi", "--module=site.wsgi", "--master"]);
        assert_eq!(appid(&desc), "uwsgi: site.wsgi");
    }

    #[test]
    fn test_java_jar() {
        let desc = descriptor(RuntimeKind::Java, &["java", "-Xmx4g", "-jar", "/opt/svc/api.jar"]);
        assert_eq!(appid(&desc), "java: api.jar");
    }

    #[test]
    fn test_java_main_class_skips_classpath() {
        let desc = descriptor(
            RuntimeKind::Java,
            &["java", "-cp", "/opt/lib/*", "com.example.Main", "--port", "8080"],
        );
        assert_eq!(appid(&desc), "java: com.example.Main");
    }

    #[test]
    fn test_node_entry_script() {
        let desc = descriptor(RuntimeKind::Node, &["node", "--max-old-space-size=4096", "server.js"]);
        assert_eq!(appid(&desc), "node: server.js");
    }

    #[test]
    fn test_ruby_script() {
        let desc = descriptor(RuntimeKind::Ruby, &["ruby", "bin/rails", "server"]);
        assert_eq!(appid(&desc), "ruby: bin/rails");
    }

    #[test]
    fn test_dotnet_assembly() {
        let desc = descriptor(RuntimeKind::DotNet, &["dotnet", "/app/Orders.dll"]);
        assert_eq!(appid(&desc), "dotnet: Orders.dll");

        let standalone = descriptor(RuntimeKind::DotNet, &["/app/Orders"]);
        assert_eq!(appid(&standalone), "dotnet: Orders");
    }

    #[test]
    fn test_no_rule_is_empty() {
        assert_eq!(appid(&descriptor(RuntimeKind::Native, &["nginx"])), "");
        assert_eq!(appid(&descriptor(RuntimeKind::Php, &["php-fpm"])), "");
        assert_eq!(appid(&descriptor(RuntimeKind::Python, &[])), "");
    }

    #[test]
    fn test_sanitization_strips_separators() {
        let desc = descriptor(RuntimeKind::Python, &["python3", "bad;name\nscript.py"]);
        let id = appid(&desc);
        assert!(!id.contains(';'));
        assert!(!id.contains('\n'));
    }
}
