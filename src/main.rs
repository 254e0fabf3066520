use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use acr::cli::{Cli, CliCommand};
use acr::config::Config;
use acr::error::Error;
use acr::fpcache::FpCache;
use acr::git;
use acr::pipeline::{ExitStatus, Pipeline, dismiss_last_run, mark_false_positives};
use acr::terminal::{SpinnerProgress, init_colors, report_width};

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .init();
}

fn fail(e: &Error) -> ! {
    if matches!(e, Error::Interrupted) {
        eprintln!("interrupted");
        std::process::exit(ExitStatus::Interrupted.code());
    }
    eprintln!("error: {e}");
    std::process::exit(ExitStatus::Error.code());
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    init_colors();

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let repo_root = git::repo_root(&cwd).unwrap_or_else(|e| {
        warn!("not in a git repository ({e}), using {}", cwd.display());
        cwd.clone()
    });
    let cache = FpCache::new(FpCache::default_dir(&repo_root));

    match cli.command {
        Some(CliCommand::MarkFp { ref indices }) => match mark_false_positives(&cache, indices) {
            Ok(out) => print!("{out}"),
            Err(e) => fail(&e),
        },
        Some(CliCommand::Dismiss) => match dismiss_last_run(&cache) {
            Ok(md) => println!("{md}"),
            Err(e) => fail(&e),
        },
        Some(CliCommand::Review) | None => {
            let status = review(&cli, repo_root).await;
            std::process::exit(status.code());
        }
    }
}

async fn review(cli: &Cli, repo_root: PathBuf) -> ExitStatus {
    let config = match Config::load(cli, &repo_root) {
        Ok(c) => c,
        Err(e) => fail(&e),
    };
    debug!(?config, "config loaded");
    let markdown = config.markdown;

    let pipeline = match Pipeline::new(config, repo_root) {
        Ok(p) => p
            .with_progress(Arc::new(SpinnerProgress::new()))
            .with_width(report_width()),
        Err(e) => fail(&e),
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    match pipeline.run(&cancel).await {
        Ok(outcome) => {
            println!("{}", outcome.report);
            if markdown && let Some(md) = outcome.markdown {
                println!();
                println!("{md}");
            }
            outcome.status
        }
        Err(e) => fail(&e),
    }
}
