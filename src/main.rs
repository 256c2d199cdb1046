//! hostscope entry point: wire the drivers, supervisor, session and
//! emitter together from the CLI surface, then run until done or told to
//! stop.
//!
//! Exit codes: 0 on a normal run, 1 on a fatal startup error (bad flags,
//! not root, missing output directory), 2 on a fatal runtime error after
//! startup.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;

use hostscope::artifact::{Emitter, EmitterConfig};
use hostscope::cli::Args;
use hostscope::domain::DriverMode;
use hostscope::drivers::{
    dotnet::DotNetDriver, java::JavaDriver, node::NodeDriver, perf::PerfDriver, php::PhpDriver,
    python::PythonDriver, ruby::RubyDriver, Driver,
};
use hostscope::session::{Session, SessionConfig, SessionError};
use hostscope::sink::{Sink, SpoolSink};
use hostscope::supervisor::Supervisor;

/// Repeated shutdown signals inside this span are the same keypress.
const SIGNAL_COALESCE: Duration = Duration::from_millis(500);

fn is_root() -> bool {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() == 0 }
}

fn build_drivers(args: &Args, storage_dir: &std::path::Path) -> Result<Vec<Driver>, String> {
    let modes = args.runtime_modes()?;
    let storage = storage_dir.to_path_buf();

    let enabled = |mode: DriverMode| mode != DriverMode::Disabled;
    Ok(vec![
        Driver::System(PerfDriver::new(args.perf_tool.as_str(), storage.clone())),
        Driver::Java(JavaDriver::new(args.java_tool.as_str(), storage.clone(), enabled(modes.java))),
        Driver::Python(PythonDriver::new(
            modes.python,
            args.pyperf_tool.as_str(),
            args.pyspy_tool.as_str(),
            storage.clone(),
        )),
        Driver::Ruby(RubyDriver::new(args.ruby_tool.as_str(), storage.clone(), enabled(modes.ruby))),
        Driver::Php(PhpDriver::new(args.php_tool.as_str(), enabled(modes.php))),
        Driver::Node(NodeDriver::new(args.perf_tool.as_str(), storage.clone(), enabled(modes.node))),
        Driver::DotNet(DotNetDriver::new(args.dotnet_tool.as_str(), storage, enabled(modes.dotnet))),
    ])
}

/// Forward SIGINT/SIGTERM into the shutdown token, coalescing repeats.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut interrupt) = signal(SignalKind::interrupt()) else { return };
        let Ok(mut terminate) = signal(SignalKind::terminate()) else { return };

        let mut last_signal: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            let now = Instant::now();
            if last_signal.is_some_and(|t| now.duration_since(t) < SIGNAL_COALESCE) {
                continue;
            }
            last_signal = Some(now);
            if shutdown.is_cancelled() {
                log::warn!("shutdown already in progress");
            } else {
                log::info!("received shutdown signal, stopping after in-flight work");
                shutdown.cancel();
            }
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    if let Err(e) = args.validate() {
        log::error!("{e}");
        return ExitCode::from(1);
    }
    if !is_root() {
        log::error!("hostscope must run as root, please re-run");
        return ExitCode::from(1);
    }
    if let Some(dir) = &args.output_dir {
        if !dir.is_dir() {
            log::error!("output directory {} does not exist", dir.display());
            return ExitCode::from(1);
        }
    }
    if let Some(spool) = &args.upload_spool {
        if !spool.is_dir() {
            log::error!("spool directory {} does not exist", spool.display());
            return ExitCode::from(1);
        }
    }

    log::info!("running hostscope (version {})", env!("CARGO_PKG_VERSION"));

    // Scratch space for sampler output files, removed on exit.
    let storage_dir = match tempfile::Builder::new().prefix("hostscope-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("cannot create temporary storage: {e}");
            return ExitCode::from(1);
        }
    };

    let drivers = match build_drivers(&args, storage_dir.path()) {
        Ok(drivers) => drivers,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(1);
        }
    };

    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if args.upload {
        let spool = args.upload_spool.clone().expect("validated above");
        sinks.push(Arc::new(SpoolSink::new(spool)));
    }

    let emitter = Arc::new(Emitter::new(
        EmitterConfig {
            output_dir: args.output_dir.clone(),
            rotating: args.rotating_output,
            flamegraph: args.flamegraph,
            flamegraph_renderer: args.flamegraph_renderer.clone(),
        },
        hostscope::hostmeta::collect(),
        sinks,
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let config = SessionConfig {
        duration: args.window_duration(),
        interval: args.interval_duration(),
        frequency: args.frequency,
        continuous: args.continuous,
    };
    let mut session = Session::new(config, Supervisor::new(drivers), emitter, shutdown);

    match session.run().await {
        Ok(summary) => {
            log::info!(
                "done: {} windows, {} degraded",
                summary.windows_run,
                summary.windows_degraded
            );
            ExitCode::SUCCESS
        }
        Err(SessionError::StartupProbeFailed) => {
            log::error!("fatal: {}", SessionError::StartupProbeFailed);
            ExitCode::from(2)
        }
    }
}
