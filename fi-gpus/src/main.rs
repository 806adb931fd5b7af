pub mod report;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use fi_gpustat::{Config, Poller, Snapshot, SnapshotStore};
use report::{ReportOptions, print_report};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// The main entry point for the `fi-gpus` utility
///
/// 1. Load the configuration (flag, file next to the binary, or defaults)
/// 2. Collect node and job status from Slurm, once or on every poll interval
/// 3. Aggregate it into a Snapshot
/// 4. Print the report, or the Snapshot as JSON
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).wrap_err("failed to load configuration")?;
    if let Some(interval) = args.interval {
        config.poll_interval_secs = interval;
    }
    if let Some(timeout) = args.timeout {
        config.command_timeout_secs = timeout;
    }
    config.validate()?;

    init_logging(&config, args.debug);
    debug!(?config, "configuration loaded");

    let opts = ReportOptions {
        top: args.top,
        partition: args.partition.clone(),
        names: args.names,
        nodes: args.nodes,
        no_color: args.no_color,
        current_user: users::get_current_username().and_then(|name| name.into_string().ok()),
    };

    let store = SnapshotStore::new();
    let mut poller = Poller::new(config.slurm_commands(), store.clone(), config.poll_interval());

    if !args.watch {
        // a one-shot run has no previous data to fall back on
        let snapshot = poller
            .run_cycle()
            .await
            .wrap_err("failed to collect cluster status")?;
        return emit(&snapshot, &store, &opts, args.json);
    }

    let mut updates = store.subscribe();
    let mut failures = store.subscribe_failures();
    let mut poller_task = tokio::spawn(poller.run(async {
        let _ = tokio::signal::ctrl_c().await;
    }));

    // redraw on every publish and on every failed cycle, until Ctrl-C stops the poller
    loop {
        tokio::select! {
            result = &mut poller_task => {
                result.wrap_err("poller task panicked")?;
                break;
            }
            Ok(()) = updates.changed() => {}
            Ok(()) = failures.changed() => {}
        }
        let snapshot = updates.borrow_and_update().clone();
        failures.borrow_and_update();
        if !args.json {
            // clear the screen and home the cursor
            print!("\x1B[2J\x1B[H");
        }
        emit(&snapshot, &store, &opts, args.json)?;
    }

    Ok(())
}

fn emit(snapshot: &Snapshot, store: &SnapshotStore, opts: &ReportOptions, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        print_report(snapshot, store.last_failure().as_deref(), opts);
    }
    Ok(())
}

/// Logs go to stderr so that reports and JSON on stdout stay clean.
/// `RUST_LOG` wins over the configured level; `--debug` wins over both
fn init_logging(config: &Config, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

const HELP: &str = "Report GPU availability and usage in a Slurm cluster: free GPUs by type (newest first), CPU and GPU load per partition, and the users with the most GPUs running and waiting. Data comes from sinfo and squeue; the commands can be changed in fi-gpus.toml next to the binary or in a file given with --config.";

#[derive(Parser, Debug)]
#[command(
    version,
    after_help = HELP,
    after_long_help = format!("{}\n\n{}", HELP, fi_gpustat::AUTHOR_HELP),
)]
struct Args {
    #[arg(short, long)]
    #[arg(help = "Path to a TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, hide = true)]
    #[arg(help = "Prints debug-level logging to stderr")]
    debug: bool,

    #[arg(short, long)]
    #[arg(help = "Seconds between updates in --watch mode (overrides the config file)")]
    interval: Option<u64>,

    #[arg(short, long)]
    #[arg(help = "Print the snapshot as JSON instead of the report")]
    json: bool,

    #[arg(short, long)]
    #[arg(help = "Shows the node names of each partition")]
    names: bool,

    #[arg(short = 'N', long)]
    #[arg(help = "List the nodes of each GPU type with their load and users")]
    nodes: bool,

    #[arg(long)]
    #[arg(help = "Disable colors in output")]
    no_color: bool,

    #[arg(short, long)]
    #[arg(help = "Only show this partition, and rank users by their jobs in it")]
    partition: Option<String>,

    #[arg(long)]
    #[arg(help = "Seconds before a sinfo or squeue call is killed (overrides the config file)")]
    timeout: Option<u64>,

    #[arg(short, long, default_value_t = 10)]
    #[arg(help = "Number of users shown on each leaderboard")]
    top: usize,

    #[arg(short, long)]
    #[arg(help = "Keep running, refreshing the report every poll interval until interrupted")]
    #[arg(
        long_help = "Keep running and refresh the report every poll interval until interrupted with Ctrl-C. If an update fails, the last good report stays on screen with the failure shown below the header."
    )]
    watch: bool,
}
