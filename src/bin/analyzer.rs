use axum::{Json, Router, extract::State, routing::get};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use via_analyzer::{
    AnalyzerConfig, AnalyzerError, CycleScheduler, Ensemble, GraphiteSink, LivenessProbe, LogSink,
    MetricsSink, NotificationSink, NullSink, RedisStore, Snapshot, SnapshotPublisher, Store,
    WebhookSink, liveness, metrics,
};

#[derive(Parser)]
#[command(name = "via-analyzer")]
#[command(about = "Periodic anomaly scan over every metric in the store")]
struct Cli {
    /// JSON config file
    #[arg(short, long, env = "VIA_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "VIA_REDIS_URL")]
    redis_url: Option<String>,

    /// Exit when this process is gone (defaults to our parent)
    #[arg(long)]
    parent_pid: Option<u32>,

    #[arg(short, long)]
    workers: Option<usize>,

    /// Ops endpoint address
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Clone)]
struct AppState {
    publisher: Arc<SnapshotPublisher>,
}

async fn metrics_handler() -> String {
    metrics::render()
}

async fn anomalies_handler(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.publisher.latest().as_ref().clone())
}

fn load_config(cli: &Cli) -> Result<AnalyzerConfig, AnalyzerError> {
    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::from_file(path)?,
        None => AnalyzerConfig::default(),
    };
    if let Some(url) = &cli.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(listen) = &cli.listen {
        config.listen_addr = Some(listen).filter(|l| !l.is_empty()).cloned();
    }
    config.parent_pid = cli
        .parent_pid
        .or(config.parent_pid)
        .or_else(|| Some(liveness::parent_pid()));
    config.validate()?;
    Ok(config)
}

async fn serve(addr: &str, state: AppState, token: CancellationToken) -> Result<(), AnalyzerError> {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .route("/anomalies", get(anomalies_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(addr, "ops endpoint listening");

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await;
        if let Err(e) = result {
            error!(error = %e, "ops endpoint stopped");
        }
    });
    Ok(())
}

async fn run(config: AnalyzerConfig) -> Result<(), AnalyzerError> {
    metrics::init();

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        ctrl_c.cancel();
    });

    let probe = LivenessProbe::new(config.parent_pid);
    probe.watch(
        Duration::from_secs(config.liveness_interval_secs),
        token.clone(),
    );

    let store: Arc<dyn Store> = Arc::new(RedisStore::open(
        &config.redis_url,
        Duration::from_secs(config.store_timeout_secs),
    )
    .await?);
    let classifier = Arc::new(Ensemble::new(config.ensemble.clone()));

    let sink: Arc<dyn MetricsSink> = match &config.graphite_host {
        Some(host) => {
            info!(host = %host, port = config.carbon_port, "sending cycle metrics to graphite");
            Arc::new(GraphiteSink::new(host, config.carbon_port))
        }
        None => Arc::new(NullSink),
    };

    let notifier: Arc<dyn NotificationSink> = match &config.webhook_url {
        Some(url) => match WebhookSink::new(url, Duration::from_secs(config.webhook_timeout_secs)) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(error = %e, "webhook unusable, alerts go to the log");
                Arc::new(LogSink)
            }
        },
        None => Arc::new(LogSink),
    };

    let publisher = Arc::new(SnapshotPublisher::new(config.anomaly_dump.clone()));

    if let Some(addr) = &config.listen_addr {
        let state = AppState {
            publisher: publisher.clone(),
        };
        serve(addr, state, token.clone()).await?;
    }

    info!(
        workers = config.workers,
        namespace = %config.full_namespace,
        parent = ?config.parent_pid,
        "analyzer starting"
    );

    let scheduler = CycleScheduler::new(config, store, classifier, sink, publisher)
        .with_alerts(notifier)?
        .with_probe(probe);

    let result = scheduler.run(token.clone()).await;
    token.cancel();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("via-analyzer: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(config).await {
        Err(AnalyzerError::ParentLost) => {
            info!("stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "analyzer failed");
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    }
}
