use clap::Parser;
use hrm_relay::app::{self, Options, RunError};
use hrm_relay::{link, shutdown};
use std::panic::{self, PanicHookInfo};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr so stdout stays clean for the JSON lines sink.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Open the link and sink, then relay until Ctrl-C or a persistent fault.
async fn run(options: Options) -> Result<(), RunError> {
    let link = link::open(options.backend, options.simulated_config()).await?;
    let sink = app::open_sink(&options)?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            trigger.trigger();
        }
    });

    let stats = app::run_with(options, link, sink, shutdown).await?;
    info!(
        published = stats.published,
        failed = stats.failed,
        link_down = stats.link_down,
        "Stopped"
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_tracing(options.verbose);

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
