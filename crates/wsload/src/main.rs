use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wsload_core::{
    Config, Connector, MetricsRegistry, MockConnector, RunController, SchedulerStatus, WsConnector,
};

/// Exit status for a config that cannot be run.
const EXIT_CONFIG: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "wsload")]
#[command(about = "WebSocket load test runner - ramps virtual users and checks thresholds")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Target URL (overrides target.url)
    #[arg(long, env = "WS_URL")]
    url: Option<String>,

    /// Connector: ws or mock
    #[arg(long, default_value = "ws")]
    mode: String,

    /// Print progress every N milliseconds (0 disables)
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,

    /// Print the final report as JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))
    {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Some(url) = args.url {
        config.target.url = url;
    }

    let connector: Arc<dyn Connector> = match args.mode.as_str() {
        "ws" => Arc::new(WsConnector::new()),
        "mock" => Arc::new(MockConnector::echo()),
        other => {
            error!("Invalid mode: {}, must be 'ws' or 'mock'", other);
            std::process::exit(EXIT_CONFIG);
        }
    };

    info!(
        "Loaded {:?}: {} ramp stage(s), peak {} users",
        args.config,
        config.ramp.stages.len(),
        config.ramp.stages.iter().map(|s| s.target).max().unwrap_or(0)
    );

    let controller = RunController::new(config, connector);

    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, shutting down");
            cancel.cancel();
        }
    });

    let progress = (args.print_every_ms > 0).then(|| {
        tokio::spawn(print_progress(
            controller.metrics(),
            controller.status_rx(),
            args.print_every_ms,
        ))
    });

    let result = controller.run().await;
    if let Some(handle) = progress {
        handle.abort();
    }

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_summary();
    }

    std::process::exit(report.exit_code());
}

async fn print_progress(
    metrics: Arc<MetricsRegistry>,
    status: watch::Receiver<SchedulerStatus>,
    every_ms: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(every_ms));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let c = metrics.counters();
        let s = status.borrow().clone();
        info!(
            "Progress: stage={:?} desired={} active={} retiring={} connects={}/{} errors={} sent={} received={}",
            s.stage,
            s.desired,
            s.active,
            s.retiring,
            c.connects_succeeded,
            c.connects_attempted,
            c.connect_errors(),
            c.messages_sent,
            c.messages_received
        );
    }
}
