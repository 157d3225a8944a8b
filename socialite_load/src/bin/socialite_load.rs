use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use socialite_load::{
    config::{self, Config, Telemetry},
    services,
    transform::{self, LocalKey},
    workload::{self, Driver, Summary, Workload},
};
use tokio::{runtime::Builder, signal, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use uuid::Uuid;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Unable to reach target services: {0}")]
    Services(#[from] services::Error),
    #[error("Invalid transform configuration: {0}")]
    Transform(#[from] transform::Error),
    #[error("Workload could not run: {0}")]
    Workload(#[from] workload::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a synthetic follow graph and drive messaging traffic against it
    Load(LoadCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct LoadCommand {
    /// path on disk to the configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// number of users to generate
    #[clap(long)]
    users: usize,
    /// maximum number of followers attached to each user
    #[clap(long)]
    maxfollows: usize,
    /// number of message rounds, each publishing once for every user
    #[clap(long)]
    messages: usize,
    /// number of concurrent workers
    #[clap(long)]
    threads: NonZeroUsize,
    /// encrypt content before publishing, 0 or 1
    #[clap(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    csfle: u8,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

impl LoadCommand {
    fn workload(&self) -> Workload {
        Workload {
            users: self.users,
            max_follows: self.maxfollows,
            messages: self.messages,
            threads: self.threads,
            csfle: self.csfle == 1,
        }
    }
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
}

fn validate_config(config_path: Option<&Path>) -> Result<Config, Error> {
    let config = Config::load(config_path)?;
    config.validate()?;
    info!("Configuration file is valid");
    Ok(config)
}

fn install_telemetry(telemetry: Option<&Telemetry>) -> Result<(), Error> {
    let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = telemetry
    else {
        return Ok(());
    };
    let run_id = Uuid::new_v4();
    info!("Exporting prometheus metrics on {addr} with run_id {run_id}");
    let mut builder = PrometheusBuilder::new()
        .with_http_listener(*addr)
        .add_global_label("run_id", run_id.to_string());
    for (k, v) in global_labels {
        builder = builder.add_global_label(k.clone(), v.clone());
    }
    builder.install()?;
    Ok(())
}

async fn inner_main(workload: Workload, config: Config) -> Result<Summary, Error> {
    install_telemetry(config.telemetry.as_ref())?;

    let services = config.target.services()?;
    let mut driver = Driver::new(workload, &config, services)?;
    if workload.csfle {
        driver = driver.with_transform(Arc::new(LocalKey::new(&config.transform)?));
    }

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c");
                ctrl_c.cancel();
            }
            Err(err) => warn!("Unable to listen for ctrl-c: {err}"),
        }
    });

    let summary = driver.with_stop(stop).run().await?;
    info!(
        graph_succeeded = summary.graph.succeeded,
        graph_failed = summary.graph.failed,
        messages_succeeded = summary.messages.succeeded,
        messages_failed = summary.messages.failed,
        follows = summary.follows,
        "Workload summary"
    );
    Ok(summary)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting socialite-load {version} run.");

    let cmd = match Cli::parse().command {
        Commands::Load(cmd) => cmd,
        Commands::ConfigCheck(cmd) => match validate_config(cmd.config_path.as_deref()) {
            Ok(_) => std::process::exit(0),
            Err(err) => {
                error!("{err}");
                std::process::exit(1)
            }
        },
    };

    let config = Config::load(cmd.config_path.as_deref())?;
    let workload = cmd.workload();
    let max_shutdown_delay = Duration::from_secs(cmd.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .worker_threads(workload.threads.get())
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(workload, config));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("socialite-load").chain(args.iter().copied()))
    }

    #[test]
    fn load_arguments_parse() {
        let cli = parse(&[
            "load",
            "--users",
            "3",
            "--maxfollows",
            "2",
            "--messages",
            "1",
            "--threads",
            "2",
            "--csfle",
            "1",
        ])
        .expect("valid arguments");
        let Commands::Load(cmd) = cli.command else {
            panic!("expected load command");
        };
        let workload = cmd.workload();
        assert_eq!(workload.users, 3);
        assert_eq!(workload.max_follows, 2);
        assert_eq!(workload.messages, 1);
        assert_eq!(workload.threads.get(), 2);
        assert!(workload.csfle);
        assert_eq!(cmd.max_shutdown_delay, 30);
        assert!(cmd.config_path.is_none());
    }

    #[test]
    fn invalid_arguments_rejected() {
        let base = ["load", "--users", "3", "--maxfollows", "2", "--messages", "1"];
        let with = |extra: &[&'static str]| {
            let mut args: Vec<&str> = base.to_vec();
            args.extend_from_slice(extra);
            parse(&args)
        };
        assert!(with(&["--threads", "2", "--csfle", "2"]).is_err());
        assert!(with(&["--threads", "0", "--csfle", "0"]).is_err());
        assert!(with(&["--threads", "2"]).is_err());
        assert!(with(&["--threads", "2", "--csfle", "0"]).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_runs_against_memory_target() {
        let config = Config {
            seed: Some([1; 32]),
            progress_interval_seconds: 0,
            ..Config::default()
        };
        let workload = Workload {
            users: 20,
            max_follows: 5,
            messages: 2,
            threads: NonZeroUsize::new(2).expect("non-zero"),
            csfle: true,
        };
        let summary = inner_main(workload, config).await.expect("run completes");
        assert_eq!(summary.graph.succeeded, 20);
        assert_eq!(summary.messages.succeeded, 2);
        assert_eq!(summary.report.failed, 0);
    }
}
