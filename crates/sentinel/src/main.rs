use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use focus_sentinel::{
    alerts::{AlertChannel, AlertDispatcher, JiraClient, SlackChannel, StdoutChannel, TicketChannel},
    config::{ChannelKind, Config, RunSourceKind},
    detector::{GithubActionsSource, ProcessRunSource, RunDetector, RunSource},
    kubernetes::{KubePodApi, KubernetesWatcher},
    logs::{FileLogSource, GithubJobLogs, KubeLogSources, LogSource, StaticLogSources},
    sentinel::Sentinel,
    server::Server,
    store::create_store,
    structure::StructureAnalyzer,
    template::AlertTemplates,
    Error,
};

/// Watches automation runs and alerts on anomalies.
#[derive(Debug, Parser)]
#[command(name = "focus-sentinel", version)]
struct Args {
    /// Override SERVER_ADDR.
    #[arg(long)]
    addr: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,

    /// Pretty-print alerts on the stdout channel.
    #[arg(long)]
    pretty: bool,
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::load().context("loading configuration")?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    config.validate().context("invalid configuration")?;
    if args.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    // Initialize store
    let store = create_store(&config.database).await?;
    store.init().await?;

    let kube_client = if config.kube.enabled {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| Error::Config(format!("Kubernetes cluster is not reachable: {}", e)))?;
        Some(client)
    } else {
        None
    };

    let source: Arc<dyn RunSource> = match config.ci.source {
        RunSourceKind::Github => Arc::new(GithubActionsSource::new(config.ci.github.clone())?),
        RunSourceKind::Process => Arc::new(ProcessRunSource::new(
            config.ci.proc_root.clone(),
            config.ci.process_pattern.clone(),
        )),
    };
    let namespace = kube_client.as_ref().map(|_| config.kube.namespace.clone());
    let detector = RunDetector::new(source, store.clone(), config.detector.clone())
        .with_scope(namespace, config.kube.labels()?);

    let analyzer = config
        .alerts
        .subsystem_rules
        .as_deref()
        .map(StructureAnalyzer::from_spec)
        .unwrap_or_default();
    let mut builder = Sentinel::builder(store.clone(), config.rules.clone())
        .detector(detector)
        .streamer(config.streamer.clone())
        .analyzer(analyzer);

    let templates = Arc::new(AlertTemplates::new(config.alerts.body_template.as_deref())?);
    for kind in &config.alerts.channels {
        let channel: Arc<dyn AlertChannel> = match kind {
            ChannelKind::Stdout => Arc::new(StdoutChannel::new(config.alerts.stdout_format.as_deref(), args.pretty)?),
            ChannelKind::Slack => Arc::new(SlackChannel::new(
                config.alerts.slack_webhook_url.as_deref().unwrap_or_default(),
                config.alerts.slack_channel.clone(),
            )?),
            ChannelKind::Ticket => {
                let jira = config
                    .alerts
                    .jira
                    .clone()
                    .ok_or_else(|| Error::Config("Jira is not configured".to_string()))?;
                let link_to = jira.link_to.clone();
                Arc::new(TicketChannel::new(Arc::new(JiraClient::new(jira)?), link_to))
            }
        };
        info!("Alerting through {}", channel.name());
        builder = builder.dispatcher(AlertDispatcher::new(
            store.clone(),
            channel,
            templates.clone(),
            &config.alerts.dispatcher,
        ));
    }

    if let Some(client) = kube_client {
        builder = builder
            .watcher(KubernetesWatcher::new(
                Arc::new(KubePodApi::new(client.clone())),
                config.watcher.clone(),
            ))
            .log_provider(Arc::new(KubeLogSources::new(client)));
    } else {
        warn!("Kubernetes disabled: pod events and pod logs will not be followed");
    }
    if config.ci.source == RunSourceKind::Github {
        builder = builder.log_provider(Arc::new(GithubJobLogs::new(
            config.ci.github.clone(),
            config.detector.poll_interval(),
        )?));
    }
    if !config.ci.log_files.is_empty() {
        let files: Vec<Arc<dyn LogSource>> = config
            .ci
            .log_files
            .iter()
            .map(|path| Arc::new(FileLogSource::new(path.clone(), Duration::from_millis(500))) as Arc<dyn LogSource>)
            .collect();
        builder = builder.log_provider(Arc::new(StaticLogSources::new(files)));
    }

    let sentinel = Arc::new(builder.build()?);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
        }
        let _ = stop_tx.send(true);
    });

    // Start server
    info!("Starting server on {}", config.server.addr);
    let server = Server::new(sentinel.clone());
    let addr = config.server.addr.clone();
    let server_task = tokio::spawn({
        let stop = stop_rx.clone();
        async move { server.start(&addr, wait_for(stop)).await }
    });

    sentinel.run(wait_for(stop_rx)).await?;
    server_task.await.context("server task")??;

    Ok(())
}
