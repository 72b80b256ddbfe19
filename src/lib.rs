//! Delivery Pipeline - queue-based notification delivery.
//!
//! Channel workers consume email, SMS and push queues with a retry-count
//! protocol and dead-letter routing; a bulk worker fans jobs out into
//! individually tracked dispatches; admin commands inspect and replay
//! dead-letter queues.

pub mod bulk;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod error;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod validation;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bulk::{BulkJobProcessor, InMemoryJobStore, JobControl, JobRepository, RedisJobStore};
use crate::cli::{Cli, Commands, RunArgs};
use crate::config::model::{AppConfig, RedisConfig};
use crate::config::ConfigManager;
use crate::delivery::messages::{ChannelPayload, EmailMessage, PushMessage, SmsMessage};
use crate::delivery::{
    ChannelHandler, ChannelKind, ChannelSender, InMemoryNotificationStore, LoggingSender,
    NotificationRepository, RedisNotificationStore, StatusUpdater, WebhookSender,
};
use crate::notify::{DeadLetterAlerter, Metrics, MetricsServer};
use crate::queue::{
    Broker, ConsumerSettings, DeadLetterMonitor, DeadLetterService, InMemoryBroker, MessageHandler,
    Publisher, QueueConsumer, QueueTopology, RedisBroker,
};
use crate::retry::{ExponentialBackoff, ProcessingMiddleware};

/// Runs the delivery pipeline with the provided CLI arguments.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level())?;

    match cli.command {
        Commands::Run(args) => run_pipeline(args, &cli.config).await,
        Commands::ConfigValidate => validate_config(&cli.config),
        Commands::ConfigShow => show_config(&cli.config),
        Commands::DlqStats => dlq_stats(&cli.config).await,
        Commands::DlqPeek { queue, limit } => dlq_peek(&cli.config, &queue, limit).await,
        Commands::DlqReprocess {
            dead_letter_queue,
            original_queue,
            delivery_tag,
        } => dlq_reprocess(&cli.config, &dead_letter_queue, &original_queue, delivery_tag).await,
        Commands::DlqReprocessAll {
            dead_letter_queue,
            original_queue,
        } => dlq_reprocess_all(&cli.config, &dead_letter_queue, &original_queue).await,
        Commands::DlqPurge { queue, yes } => dlq_purge(&cli.config, &queue, yes).await,
        Commands::JobProgress { job_id } => {
            let progress = job_control(&cli.config).await?.progress(job_id).await?;
            println!("{}", progress);
            Ok(())
        }
        Commands::JobCancel { job_id } => {
            job_control(&cli.config).await?.cancel(job_id).await?;
            println!("Job {} cancelled.", job_id);
            Ok(())
        }
        Commands::JobRun { job_id } => {
            job_control(&cli.config).await?.publish_run(job_id).await?;
            println!("Job {} queued.", job_id);
            Ok(())
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Builds the Redis URL from configuration.
fn build_redis_url(config: &RedisConfig) -> String {
    match &config.password {
        Some(pass) => format!("redis://:{}@{}:{}/{}", pass, config.host, config.port, config.db),
        None => format!("redis://{}:{}/{}", config.host, config.port, config.db),
    }
}

/// Stores and transport shared by every worker.
struct Services {
    notifications: Arc<dyn NotificationRepository>,
    updater: Arc<dyn StatusUpdater>,
    jobs: Arc<dyn JobRepository>,
    sender: Arc<dyn ChannelSender>,
}

impl Services {
    fn new<N>(notifications: Arc<N>, jobs: Arc<dyn JobRepository>, sender: Arc<dyn ChannelSender>) -> Self
    where
        N: NotificationRepository + 'static,
    {
        Self {
            updater: notifications.clone(),
            notifications,
            jobs,
            sender,
        }
    }
}

/// Runs all consumers until Ctrl+C.
async fn run_pipeline(args: RunArgs, config_path: &Path) -> Result<()> {
    info!("Starting delivery pipeline");

    let config_manager = ConfigManager::new(config_path)?;
    let config = config_manager.get_config();
    info!(path = %config_manager.config_path().display(), "Configuration loaded and validated");

    let metrics = Arc::new(Metrics::new()?);
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    if config.prometheus.enabled {
        let server = MetricsServer::new(metrics.clone(), config.prometheus.port);
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(server_cancel).await {
                error!(error = %e, "Prometheus server failed");
            }
        });
        info!(port = config.prometheus.port, "Prometheus metrics server started");
    }

    if args.dry_run {
        info!("Dry run: using in-process broker, messages are logged instead of sent");
        let services = Services::new(
            Arc::new(InMemoryNotificationStore::new()),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(LoggingSender),
        );
        let broker = InMemoryBroker::new().with_visibility_timeout(visibility_timeout(&config));
        serve(Arc::new(broker), services, config, &args, metrics, cancel).await
    } else {
        let redis_url = build_redis_url(&config.redis);
        let connection = queue::redis::connect(&redis_url).await?;
        info!("Connected to Redis");

        let services = Services::new(
            Arc::new(RedisNotificationStore::new(connection.clone())),
            Arc::new(RedisJobStore::new(connection.clone())),
            Arc::new(WebhookSender::new(&config.channels)?),
        );
        let broker = RedisBroker::new(connection).with_visibility_timeout(visibility_timeout(&config));
        serve(Arc::new(broker), services, config, &args, metrics, cancel).await
    }
}

/// Picks the main queues this process consumes.
fn selected_queues(config: &AppConfig, filter: &[String]) -> Result<Vec<String>> {
    let all = config.queues.all();
    if filter.is_empty() {
        return Ok(all.iter().map(|q| q.to_string()).collect());
    }

    for queue in filter {
        if !all.contains(&queue.as_str()) {
            anyhow::bail!("Unknown queue '{}', expected one of: {}", queue, all.join(", "));
        }
    }
    Ok(filter.to_vec())
}

async fn serve<B>(
    broker: Arc<B>,
    services: Services,
    config: Arc<AppConfig>,
    args: &RunArgs,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<()>
where
    B: Broker + 'static,
{
    let selected = selected_queues(&config, &args.queues)?;

    // The bulk worker publishes to channel queues this process may not consume.
    for queue in config.queues.all() {
        broker
            .declare_with_dead_letter(&QueueTopology::for_queue(queue))
            .await?;
    }

    let settings = ConsumerSettings::from_config(&config.retry, &config.consumer);
    let middleware = config.consumer.in_process_retry.then(|| {
        ProcessingMiddleware::new(Arc::new(ExponentialBackoff::from_config(&config.retry)))
    });

    let mut tasks = JoinSet::new();

    for kind in ChannelKind::ALL {
        let queue = config.queues.for_channel(kind);
        if !selected.iter().any(|q| q == queue) {
            continue;
        }

        match kind {
            ChannelKind::Email => spawn_channel_consumer::<B, EmailMessage>(
                &mut tasks, &broker, &services, queue, &settings, middleware.clone(), &metrics, &cancel,
            ),
            ChannelKind::Sms => spawn_channel_consumer::<B, SmsMessage>(
                &mut tasks, &broker, &services, queue, &settings, middleware.clone(), &metrics, &cancel,
            ),
            ChannelKind::Push => spawn_channel_consumer::<B, PushMessage>(
                &mut tasks, &broker, &services, queue, &settings, middleware.clone(), &metrics, &cancel,
            ),
        }
    }

    if selected.iter().any(|q| q == &config.queues.bulk) {
        let publisher: Arc<dyn Publisher> = broker.clone();
        let processor = BulkJobProcessor::new(
            services.jobs.clone(),
            services.notifications.clone(),
            publisher,
            config.queues.clone(),
            &config.bulk,
        )
        .with_metrics(metrics.clone());
        info!(worker_id = %processor.worker_id(), "Bulk processor ready");

        let consumer = QueueConsumer::new(
            broker.clone(),
            Arc::new(processor),
            config.queues.bulk.clone(),
            settings.clone(),
        )
        .with_metrics(metrics.clone());
        spawn_consumer(&mut tasks, consumer, cancel.clone());
    }

    if config.monitor.enabled {
        let service = DeadLetterService::for_main_queues(broker.clone(), &config.queues.all());
        let mut monitor = DeadLetterMonitor::new(
            Arc::new(service),
            Duration::from_secs(config.monitor.interval_seconds),
            config.monitor.alert_threshold,
        )
        .with_metrics(metrics.clone());
        if let Some(url) = &config.monitor.alert_webhook_url {
            monitor = monitor.with_alerter(DeadLetterAlerter::new(url.clone()));
        }

        let monitor_cancel = cancel.clone();
        tasks.spawn(async move { monitor.run(monitor_cancel).await });
    }

    info!(queues = ?selected, "Delivery pipeline is running. Press Ctrl+C to stop.");

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Worker task panicked");
        }
    }

    broker.close().await?;
    info!("Delivery pipeline stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_channel_consumer<B, P>(
    tasks: &mut JoinSet<()>,
    broker: &Arc<B>,
    services: &Services,
    queue: &str,
    settings: &ConsumerSettings,
    middleware: Option<ProcessingMiddleware>,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
) where
    B: Broker + 'static,
    P: ChannelPayload,
{
    let handler = ChannelHandler::<P>::new(services.sender.clone(), services.updater.clone());
    let mut consumer = QueueConsumer::new(broker.clone(), Arc::new(handler), queue, settings.clone())
        .with_failure_marker(services.updater.clone())
        .with_metrics(metrics.clone());
    if let Some(middleware) = middleware {
        consumer = consumer.with_middleware(middleware);
    }
    spawn_consumer(tasks, consumer, cancel.clone());
}

fn spawn_consumer<B, H>(tasks: &mut JoinSet<()>, consumer: QueueConsumer<B, H>, cancel: CancellationToken)
where
    B: Broker + 'static,
    H: MessageHandler + 'static,
{
    tasks.spawn(async move {
        if let Err(e) = consumer.run(cancel).await {
            error!(queue = %consumer.queue(), error = %e, "Consumer failed");
        }
    });
}

/// Validates the configuration file and reports any issues.
fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::loader::load_from_path(config_path)?;
    let result = validation::validate_config(&config);

    println!("{}", validation::report::format_report(&result));
    if !result.is_valid() {
        anyhow::bail!(error::ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    println!("Queues:");
    for queue in config.queues.all() {
        let topology = QueueTopology::for_queue(queue);
        println!(
            "  - {} (dead-letter: {} via {})",
            topology.queue, topology.dead_letter_queue, topology.dead_letter_exchange
        );
    }
    Ok(())
}

/// Displays the parsed configuration.
fn show_config(config_path: &Path) -> Result<()> {
    let config = config::loader::load_and_validate(config_path)?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

async fn redis_broker(config_path: &Path) -> Result<(Arc<AppConfig>, Arc<RedisBroker>)> {
    let config = Arc::new(config::loader::load_and_validate(config_path)?);
    let broker = RedisBroker::connect(&build_redis_url(&config.redis))
        .await?
        .with_visibility_timeout(visibility_timeout(&config));
    Ok((config, Arc::new(broker)))
}

fn visibility_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.consumer.visibility_timeout_seconds)
}

async fn dead_letter_service(config_path: &Path) -> Result<DeadLetterService<RedisBroker>> {
    let (config, broker) = redis_broker(config_path).await?;
    Ok(DeadLetterService::for_main_queues(broker, &config.queues.all()))
}

async fn job_control(config_path: &Path) -> Result<JobControl> {
    let (config, broker) = redis_broker(config_path).await?;
    let jobs = Arc::new(RedisJobStore::new(broker.connection()));
    Ok(JobControl::new(jobs, broker, config.queues.bulk.clone()))
}

/// Prints message and consumer counts for every dead-letter queue.
async fn dlq_stats(config_path: &Path) -> Result<()> {
    let service = dead_letter_service(config_path).await?;
    let stats = service.stats().await;

    if stats.is_empty() {
        println!("No dead-letter queues could be read.");
        return Ok(());
    }

    println!("Dead-letter queues:");
    for info in stats {
        println!(
            "  {} - {} message(s), {} consumer(s)",
            info.queue, info.message_count, info.consumer_count
        );
    }
    Ok(())
}

async fn dlq_peek(config_path: &Path, queue: &str, limit: usize) -> Result<()> {
    let service = dead_letter_service(config_path).await?;
    let messages = service.peek(queue, limit).await?;

    if messages.is_empty() {
        println!("Queue '{}' is empty.", queue);
        return Ok(());
    }

    println!("Queue '{}' ({} shown):", queue, messages.len());
    for message in messages {
        println!(
            "  [{}] retry-count={} redelivered={}",
            message.delivery_tag, message.retry_count, message.redelivered
        );
        for (name, value) in &message.headers {
            println!("      {}: {}", name, value);
        }
        println!("      {}", message.body);
    }
    Ok(())
}

async fn dlq_reprocess(
    config_path: &Path,
    dead_letter_queue: &str,
    original_queue: &str,
    delivery_tag: u64,
) -> Result<()> {
    let service = dead_letter_service(config_path).await?;

    if service
        .reprocess_one(dead_letter_queue, original_queue, delivery_tag)
        .await?
    {
        println!("Moved one message from {} to {}.", dead_letter_queue, original_queue);
    } else {
        println!("Queue '{}' is empty.", dead_letter_queue);
    }
    Ok(())
}

async fn dlq_reprocess_all(config_path: &Path, dead_letter_queue: &str, original_queue: &str) -> Result<()> {
    let service = dead_letter_service(config_path).await?;
    let count = service
        .reprocess_all(dead_letter_queue, original_queue)
        .await?;
    println!("Moved {} message(s) from {} to {}.", count, dead_letter_queue, original_queue);
    Ok(())
}

async fn dlq_purge(config_path: &Path, queue: &str, confirmed: bool) -> Result<()> {
    if !confirmed {
        anyhow::bail!("Refusing to purge '{}' without --yes", queue);
    }

    let service = dead_letter_service(config_path).await?;
    let count = service.purge(queue).await?;
    println!("Purged {} message(s) from {}.", count, queue);
    Ok(())
}
