//! CLI argument definitions

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::domain::DriverMode;

#[derive(Parser, Debug)]
#[command(name = "hostscope", version, about = "Continuous whole-host sampling profiler")]
pub struct Args {
    /// Profiling duration per window in seconds
    #[arg(short = 'd', long, default_value = "60", env = "HOSTSCOPE_DURATION")]
    pub duration: u64,

    /// Sampling frequency in Hz
    #[arg(short = 'f', long, default_value = "10", env = "HOSTSCOPE_FREQUENCY")]
    pub frequency: u32,

    /// Seconds between window starts (defaults to the duration, i.e.
    /// back-to-back windows). This is start-to-start, not end-to-start.
    #[arg(short = 'i', long, env = "HOSTSCOPE_INTERVAL")]
    pub interval: Option<u64>,

    /// Profile window after window until stopped
    #[arg(short = 'c', long, env = "HOSTSCOPE_CONTINUOUS")]
    pub continuous: bool,

    /// Directory for local artifact output
    #[arg(short = 'o', long, env = "HOSTSCOPE_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Keep only the latest profile result
    #[arg(long)]
    pub rotating_output: bool,

    /// Submit finished artifacts to the upload sink
    #[arg(short = 'u', long, env = "HOSTSCOPE_UPLOAD")]
    pub upload: bool,

    /// Spool directory the upload sink hands artifacts to
    #[arg(long, requires = "upload", env = "HOSTSCOPE_UPLOAD_SPOOL")]
    pub upload_spool: Option<PathBuf>,

    /// Per-runtime driver mode as RUNTIME=MODE, e.g. --mode python=ebpf
    /// or --mode java=disabled (repeatable; modes: auto/ebpf/attach/disabled)
    #[arg(long = "mode", value_name = "RUNTIME=MODE")]
    pub modes: Vec<String>,

    /// Render a local flamegraph next to each collapsed file
    #[arg(long, requires = "output_dir")]
    pub flamegraph: bool,

    /// External folded-to-HTML renderer used with --flamegraph
    #[arg(long, default_value = "hostscope-burn")]
    pub flamegraph_renderer: String,

    /// System-wide sampler executable
    #[arg(long, default_value = "perf")]
    pub perf_tool: String,

    /// async-profiler launcher executable
    #[arg(long, default_value = "asprof")]
    pub java_tool: String,

    /// eBPF python sampler executable
    #[arg(long, default_value = "pyperf")]
    pub pyperf_tool: String,

    /// Attach-based python sampler executable
    #[arg(long, default_value = "py-spy")]
    pub pyspy_tool: String,

    /// Ruby sampler executable
    #[arg(long, default_value = "rbspy")]
    pub ruby_tool: String,

    /// PHP sampler executable
    #[arg(long, default_value = "phpspy")]
    pub php_tool: String,

    /// .NET trace collector executable
    #[arg(long, default_value = "dotnet-trace")]
    pub dotnet_tool: String,

    /// Log at debug level
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Resolved per-runtime driver modes (default Auto everywhere).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeModes {
    pub java: DriverMode,
    pub python: DriverMode,
    pub ruby: DriverMode,
    pub php: DriverMode,
    pub node: DriverMode,
    pub dotnet: DriverMode,
}

impl Default for RuntimeModes {
    fn default() -> Self {
        RuntimeModes {
            java: DriverMode::Auto,
            python: DriverMode::Auto,
            ruby: DriverMode::Auto,
            php: DriverMode::Auto,
            node: DriverMode::Auto,
            dotnet: DriverMode::Auto,
        }
    }
}

impl Args {
    /// Start-to-start window interval.
    #[must_use]
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval.unwrap_or(self.duration))
    }

    #[must_use]
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    /// Parse the repeatable `--mode RUNTIME=MODE` flags.
    pub fn runtime_modes(&self) -> Result<RuntimeModes, String> {
        let mut modes = RuntimeModes::default();
        for entry in &self.modes {
            let (runtime, mode) = entry
                .split_once('=')
                .ok_or_else(|| format!("--mode expects RUNTIME=MODE, got {entry:?}"))?;
            let mode: DriverMode = mode.parse()?;
            match runtime.to_ascii_lowercase().as_str() {
                "java" => modes.java = mode,
                "python" => modes.python = mode,
                "ruby" => modes.ruby = mode,
                "php" => modes.php = mode,
                "node" => modes.node = mode,
                "dotnet" => modes.dotnet = mode,
                other => return Err(format!("unknown runtime {other:?} in --mode")),
            }
        }
        Ok(modes)
    }

    /// Cross-flag validation clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.duration == 0 {
            return Err("--duration must be positive".to_string());
        }
        if self.frequency == 0 {
            return Err("--frequency must be positive".to_string());
        }
        if self.continuous && self.interval_duration() < self.window_duration() {
            return Err(
                "--duration must be lower or equal to --interval in continuous mode".to_string()
            );
        }
        if self.output_dir.is_none() && !self.upload {
            return Err("pass at least one output method (--upload / --output-dir)".to_string());
        }
        if self.upload && self.upload_spool.is_none() {
            return Err("--upload requires --upload-spool".to_string());
        }
        self.runtime_modes().map(|_| ())
    }
}
