use anyhow::Result;
use clap::Parser;

use review_gc::cli::Cli;
use review_gc::config::{Config, default_config_path};
use review_gc::{AppContext, GcOptions, cmd_gc};

fn main() -> Result<()> {
    // Conflicting verbosity flags exit here, before any repository access.
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.debug, cli.quiet);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path)?;

    let ctx = AppContext::production(&cli.repo, &config);
    let opts = GcOptions {
        dry_run: cli.dry_run,
        auto: cli.auto,
    };
    cmd_gc(&ctx, &config, opts)?;
    Ok(())
}

// ─── Logging setup ────────────────────────────────────────────────────────────

/// Configure the global `tracing` subscriber based on CLI verbosity flags.
///
/// | flags              | effective level |
/// |--------------------|-----------------|
/// | `--quiet`          | `ERROR`         |
/// | *(default)*        | `INFO`          |
/// | `-v`               | `DEBUG`         |
/// | `-vv` / `--debug`  | `TRACE`         |
///
/// The `RUST_LOG` environment variable takes precedence over all flags.
fn init_tracing(verbose: u8, debug: bool, quiet: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = if quiet {
        "error"
    } else if debug {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("review_gc={level}")));

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
