// Main application entry point: argument parsing, logging setup, signal
// handling and the test lifecycle.

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use volta::cli;
use volta::config;
use volta::core::Core;
use volta::VoltaError;

/// Stderr verbosity follows the flags; the log file always gets DEBUG.
fn init_logging(args: &cli::Args) -> std::io::Result<()> {
    let stderr_level = if args.trace {
        LevelFilter::TRACE
    } else if args.verbose {
        LevelFilter::DEBUG
    } else if args.quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    let log_file = std::fs::File::create(&args.log)?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_level),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
    Ok(())
}

fn run(args: &cli::Args) -> Result<(), VoltaError> {
    let config = config::load(args.defaults.as_deref(), &args.config, &args.patches)?;
    let mut core = Core::new(config)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "got signal, going to stop");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let result = core.configure().and_then(|()| core.start_test());
    match &result {
        Ok(()) => {
            info!("test running, interrupt with Ctrl+C or SIGTERM");
            while !interrupted.load(Ordering::SeqCst) && !core.test_finished() {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        Err(e) => error!("failed to start test: {e}"),
    }
    // interrupt and clean end-of-input take the same path from here
    core.end_test();
    core.post_process();
    core.session.relocate_log(&args.log);
    result
}

fn main() {
    let args = cli::parse_args();
    if let Err(e) = init_logging(&args) {
        eprintln!("failed to open log file {}: {e}", args.log.display());
        exit(1);
    }
    info!("volta core init");
    exit(match run(&args) {
        Ok(()) => 0,
        Err(e @ VoltaError::Config(_)) => {
            error!("{e}");
            2
        }
        Err(e) => {
            error!("uncaught exception in core: {e}");
            1
        }
    });
}
