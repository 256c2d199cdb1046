//! Parsing of sub-profiler output into canonical partial profiles.
//!
//! Every external tool reports in some flavor of "collapsed" stacks:
//!
//! * single-process folded lines (`frame;frame;... count`) from the
//!   attach-based samplers,
//! * pid-prefixed folded lines (`comm-pid/tid;frame;... count`) from the
//!   streaming eBPF sampler,
//! * `perf script` sample blocks from the system-wide sampler.
//!
//! Parsing is tolerant per line: malformed lines are skipped and counted,
//! and the driver fails the window transiently only when the malformed
//! fraction crosses [`MALFORMED_FRACTION_LIMIT`].
//!
//! Folded input is root-first (flamegraph convention); the internal
//! [`Stack`] representation is leaf-first, so folded frames are reversed on
//! entry. `perf script` prints frames leaf-first already.

use std::collections::HashMap;

use crate::domain::{Frame, FrameKind, PartialProfile, Pid, Stack, StackCounts};

/// A window fails transiently when more than this fraction of output lines
/// are malformed.
pub const MALFORMED_FRACTION_LIMIT: f64 = 0.05;

/// Per-parse bookkeeping for the malformed-line threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Lines that looked like stack data (blank lines and comments are not
    /// counted).
    pub total: usize,
    pub malformed: usize,
}

impl ParseStats {
    pub(crate) fn record_ok(&mut self) {
        self.total += 1;
    }

    pub(crate) fn record_malformed(&mut self) {
        self.total += 1;
        self.malformed += 1;
    }

    /// True when the malformed fraction exceeds the tolerated limit.
    #[must_use]
    pub fn exceeds_threshold(&self) -> bool {
        if self.total == 0 {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.malformed as f64 / self.total as f64;
        fraction > MALFORMED_FRACTION_LIMIT
    }
}

/// Known provenance suffixes emitted by the samplers themselves.
///
/// Checked longest-first so `_[pn]` is not mistaken for `_[p]` plus residue.
const SUFFIX_KINDS: &[(&str, FrameKind)] = &[
    ("_[pn]", FrameKind::PythonNative),
    ("_[php]", FrameKind::Php),
    ("_[net]", FrameKind::DotNet),
    ("_[rb]", FrameKind::Ruby),
    ("_[p]", FrameKind::Python),
    ("_[k]", FrameKind::Kernel),
];

/// Build a [`Frame`] from raw symbol text.
///
/// Tools that emit their own provenance markers (`sym_[k]`, `sym_[p]`, ...)
/// have the marker stripped and translated; everything else gets
/// `default_kind`. The provenance set here never changes afterwards.
#[must_use]
pub fn frame_from_symbol(symbol: &str, default_kind: FrameKind) -> Frame {
    for (suffix, kind) in SUFFIX_KINDS {
        if let Some(stripped) = symbol.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return Frame::new(stripped, *kind);
            }
        }
    }
    Frame::new(symbol, default_kind)
}

fn parse_folded_line(line: &str, default_kind: FrameKind) -> Option<(Stack, u64)> {
    let (stack_part, count_part) = line.rsplit_once(' ')?;
    let count: u64 = count_part.trim().parse().ok()?;
    if stack_part.is_empty() {
        return None;
    }
    // Folded is root-first; flip to leaf-first.
    let frames: Vec<Frame> = stack_part
        .split(';')
        .rev()
        .map(|sym| frame_from_symbol(sym, default_kind))
        .collect();
    Some((Stack::new(frames), count))
}

/// Parse a single-process stack-collapsed listing.
pub fn parse_collapsed(text: &str, default_kind: FrameKind) -> (StackCounts, ParseStats) {
    let mut counts = StackCounts::new();
    let mut stats = ParseStats::default();

    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_folded_line(line, default_kind) {
            Some((stack, count)) => {
                stats.record_ok();
                counts.add(stack, count);
            }
            None => {
                log::debug!("bad collapsed line: {line:?}");
                stats.record_malformed();
            }
        }
    }

    (counts, stats)
}

/// Parse one `comm-pid/tid;frame;... count` line. Used both for whole-file
/// parsing and line-at-a-time by the streaming sampler's reader thread.
pub fn parse_pid_folded_line(line: &str, default_kind: FrameKind) -> Option<(Pid, Stack, u64)> {
    let (stack_part, count_part) = line.rsplit_once(' ')?;
    let count: u64 = count_part.trim().parse().ok()?;

    // Leading component is "comm-pid/tid"; the comm is dropped here because
    // the merger adds its own command label at the root.
    let (origin, stack_text) = stack_part.split_once(';')?;
    let (_comm, pid_tid) = origin.rsplit_once('-')?;
    let (pid_text, _tid) = pid_tid.split_once('/')?;
    let pid: u32 = pid_text.parse().ok()?;

    let frames: Vec<Frame> =
        stack_text.split(';').rev().map(|sym| frame_from_symbol(sym, default_kind)).collect();
    Some((Pid(pid), Stack::new(frames), count))
}

/// Parse a stack-collapsed listing where each stack is prefixed with the
/// command and pid/tid of its origin, as the streaming eBPF sampler emits.
pub fn parse_many_collapsed(text: &str, default_kind: FrameKind) -> (PartialProfile, ParseStats) {
    let mut profile: PartialProfile = HashMap::new();
    let mut stats = ParseStats::default();

    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_pid_folded_line(line, default_kind) {
            Some((pid, stack, count)) => {
                stats.record_ok();
                profile.entry(pid).or_default().add(stack, count);
            }
            None => {
                log::debug!("bad pid-collapsed line: {line:?}");
                stats.record_malformed();
            }
        }
    }

    (profile, stats)
}

// ── perf script ──────────────────────────────────────────────────────────

/// Locate the `pid/tid` token in a `perf script` sample header.
///
/// The comm may contain spaces, so the header is scanned token-wise for the
/// first `<int>/<int>` pair instead of being split positionally.
fn parse_sample_header(header: &str) -> Option<i64> {
    for token in header.split_whitespace() {
        if let Some((pid_text, tid_text)) = token.split_once('/') {
            if let (Ok(pid), Ok(_tid)) = (pid_text.parse::<i64>(), tid_text.parse::<i64>()) {
                return Some(pid);
            }
        }
    }
    None
}

/// Parse one frame line: `<hex-addr> <symbol>[+offset] (<dso>)`.
fn parse_frame_line(line: &str) -> Option<Frame> {
    let line = line.trim();
    let (addr, rest) = line.split_once(' ')?;
    if addr.is_empty() || !addr.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let rest = rest.trim();
    if !rest.ends_with(')') {
        return None;
    }
    let open = rest.rfind(" (")?;
    let dso = &rest[open + 2..rest.len() - 1];
    let mut sym = &rest[..open];
    // Strip the +0x... offset part.
    if let Some(plus) = sym.find('+') {
        sym = &sym[..plus];
    }

    // An unknown symbol in a known DSO is more useful reported as the DSO.
    let symbol = if sym == "[unknown]" && dso != "[unknown]" {
        format!("[{dso}]")
    } else {
        sym.to_string()
    };

    let kind = if dso.contains("kernel") || dso.contains("vmlinux") {
        FrameKind::Kernel
    } else {
        FrameKind::Native
    };
    Some(Frame::new(symbol, kind))
}

/// Parse `perf script` output into a partial profile keyed by pid.
///
/// Samples are blank-line separated blocks: a header line followed by one
/// frame line per level, leaf first. Samples with an unparseable header and
/// frame lines that do not match the expected shape are counted malformed.
pub fn parse_perf_script(script: &str) -> (PartialProfile, ParseStats) {
    let mut profile: PartialProfile = HashMap::new();
    let mut stats = ParseStats::default();

    for block in script.split("\n\n") {
        let block = block.trim();
        if block.is_empty() || block.starts_with('#') {
            continue;
        }

        let mut lines = block.lines();
        let Some(header) = lines.next() else {
            continue;
        };
        let Some(pid) = parse_sample_header(header) else {
            stats.record_malformed();
            continue;
        };
        if pid < 0 {
            // perf reports pid -1 for lost/idle records; nothing to key on.
            stats.record_ok();
            continue;
        }
        stats.record_ok();

        let mut frames = Vec::new();
        let mut dropped = false;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match parse_frame_line(line) {
                Some(frame) => frames.push(frame),
                None => {
                    log::debug!("bad perf frame line: {line:?}");
                    stats.record_malformed();
                    dropped = true;
                    break;
                }
            }
        }
        if dropped || frames.is_empty() {
            continue;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        profile.entry(Pid(pid as u32)).or_default().add(Stack::new(frames), 1);
    }

    (profile, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collapsed_basic() {
        let text = "main;foo;bar 4\nmain;baz 1\n";
        let (counts, stats) = parse_collapsed(text, FrameKind::Python);
        assert_eq!(stats, ParseStats { total: 2, malformed: 0 });
        assert_eq!(counts.total(), 5);

        // Folded root-first becomes leaf-first internally.
        let stack = Stack::new(vec![
            Frame::new("bar", FrameKind::Python),
            Frame::new("foo", FrameKind::Python),
            Frame::new("main", FrameKind::Python),
        ]);
        assert_eq!(counts.get(&stack), Some(4));
    }

    #[test]
    fn test_parse_collapsed_skips_comments_and_blanks() {
        let text = "# metadata line\n\nf;g 2\n";
        let (counts, stats) = parse_collapsed(text, FrameKind::Native);
        assert_eq!(stats.total, 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn test_parse_collapsed_counts_malformed() {
        let text = "good;stack 3\nbad line without count\nalso_bad NaN\n";
        let (counts, stats) = parse_collapsed(text, FrameKind::Native);
        assert_eq!(counts.total(), 3);
        assert_eq!(stats, ParseStats { total: 3, malformed: 2 });
    }

    #[test]
    fn test_suffix_translation() {
        let frame = frame_from_symbol("do_syscall_64_[k]", FrameKind::Native);
        assert_eq!(frame, Frame::new("do_syscall_64", FrameKind::Kernel));

        let frame = frame_from_symbol("PyEval_SomeNative_[pn]", FrameKind::Python);
        assert_eq!(frame, Frame::new("PyEval_SomeNative", FrameKind::PythonNative));

        // No marker: default kind applies.
        let frame = frame_from_symbol("main", FrameKind::Ruby);
        assert_eq!(frame, Frame::new("main", FrameKind::Ruby));
    }

    #[test]
    fn test_parse_many_collapsed_keys_by_pid() {
        let text = "uwsgi-1234/1235;app;handler 7\nuwsgi-1234/1236;app;other 3\nworker-99/99;run 1\n";
        let (profile, stats) = parse_many_collapsed(text, FrameKind::Python);
        assert_eq!(stats.malformed, 0);
        assert_eq!(profile.len(), 2);
        assert_eq!(profile[&Pid(1234)].total(), 10);
        assert_eq!(profile[&Pid(99)].total(), 1);
    }

    #[test]
    fn test_parse_many_collapsed_drops_comm() {
        let text = "python-10/10;entry 2\n";
        let (profile, _) = parse_many_collapsed(text, FrameKind::Python);
        let stack = Stack::new(vec![Frame::new("entry", FrameKind::Python)]);
        assert_eq!(profile[&Pid(10)].get(&stack), Some(2));
    }

    #[test]
    fn test_threshold() {
        let mut stats = ParseStats { total: 100, malformed: 5 };
        assert!(!stats.exceeds_threshold());
        stats.malformed = 6;
        assert!(stats.exceeds_threshold());
        assert!(!ParseStats::default().exceeds_threshold());
    }

    const PERF_SCRIPT: &str = "\
myapp  1234/1234  [002] 1035.541926: 10101010 cycles: \n\
\t            55f1a0b2c3d4 process_request+0x24 (/usr/bin/myapp)\n\
\t            55f1a0b2aaaa main+0x120 (/usr/bin/myapp)\n\
\n\
myapp  1234/1235  [003] 1035.551926: 10101010 cycles: \n\
\tffffffff81082227 mmput+0x57 ([kernel.kallsyms])\n\
\t            55f1a0b2aaaa main+0x120 (/usr/bin/myapp)\n\
\n\
other proc  77/77  [000] 1035.561926: cycles: \n\
\t            7fe48f00faff [unknown] (/lib/x86_64-linux-gnu/libfoo.so)\n";

    #[test]
    fn test_parse_perf_script() {
        let (profile, stats) = parse_perf_script(PERF_SCRIPT);
        assert_eq!(stats.malformed, 0);
        assert_eq!(profile[&Pid(1234)].total(), 2);

        // Kernel frames are tagged by DSO.
        let kernel_stack = Stack::new(vec![
            Frame::new("mmput", FrameKind::Kernel),
            Frame::new("main", FrameKind::Native),
        ]);
        assert_eq!(profile[&Pid(1234)].get(&kernel_stack), Some(1));

        // Unknown symbol in a known DSO becomes the bracketed DSO name,
        // and a comm containing a space still parses.
        let dso_stack = Stack::new(vec![Frame::new(
            "[/lib/x86_64-linux-gnu/libfoo.so]",
            FrameKind::Native,
        )]);
        assert_eq!(profile[&Pid(77)].get(&dso_stack), Some(1));
    }

    #[test]
    fn test_parse_perf_script_bad_header_counted() {
        let (profile, stats) = parse_perf_script("not a header at all\n\tgarbage\n");
        assert!(profile.is_empty());
        assert_eq!(stats.malformed, 1);
    }
}
