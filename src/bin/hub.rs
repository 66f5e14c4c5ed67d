use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser};
use daily_dispatch::{
    actors::{
        alert::AlertHandle,
        monitor::{DeliveryMonitor, MonitorHandle},
        trigger::TriggerHandle,
    },
    alerts::{AlertManager, AlertPublisher},
    clock::{Clock, SystemClock},
    collaborators::{Collaborators, HttpRelayChannel, InMemoryDirectory, TemplateContentGenerator},
    config::{Config, read_config_file},
    fallback::FallbackAssigner,
    queue::{QueueManager, QueueName},
    scheduler::Scheduler,
    storage,
    util::get_relay_token,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Run the scheduling pass once right after startup
    #[arg(long)]
    schedule_now: bool,

    /// Run the fallback assignment once right after startup
    #[arg(long)]
    fallback_now: bool,

    /// Hold back alert notifications for this many seconds after startup
    #[arg(long, value_name = "SECS")]
    mute_alerts: Option<u64>,

    /// More output (-v debug, -vv trace)
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("daily_dispatch", level),
        ("dispatch_hub", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let directory = match &config.directory.seed {
        Some(path) => Arc::new(InMemoryDirectory::from_seed_file(path)?),
        None => {
            warn!("no directory seed configured, starting with an empty directory");
            Arc::new(InMemoryDirectory::new())
        }
    };

    let channel = config
        .channel
        .as_ref()
        .context("a `channel` section is required")?;
    let token = channel.token.clone().or_else(get_relay_token);

    Ok(Collaborators {
        content: directory.clone(),
        advisors: directory,
        channel: Arc::new(HttpRelayChannel::new(
            channel.url.clone(),
            token,
            channel.confirms_delivery,
        )),
        generator: Arc::new(TemplateContentGenerator::new(
            config.delivery.default_language.clone(),
        )),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = storage::open(&config.storage)
        .await
        .context("failed to open storage")?;
    let health = store
        .health_check()
        .await
        .context("storage health check failed")?;
    if !health.healthy {
        anyhow::bail!("storage is not operational: {}", health.message);
    }
    match store.get_stats().await {
        Ok(stats) => info!("{stats}"),
        Err(e) => warn!("could not read storage stats: {e}"),
    }
    let collaborators = collaborators(&config)?;

    let queues = Arc::new(QueueManager::new());
    queues.create_queue(QueueName::Delivery, config.queue.delivery.clone());
    queues.create_queue(QueueName::FallbackDelivery, config.queue.fallback.clone());

    let publisher = AlertPublisher::new(store.clone(), clock.clone(), config.monitor.clone());

    let scheduler = Scheduler::new(
        &config,
        store.clone(),
        queues.clone(),
        collaborators.clone(),
        publisher.clone(),
        clock.clone(),
    );
    scheduler
        .register_workers()
        .context("failed to register queue workers")?;

    let fallback = FallbackAssigner::new(
        &config,
        store.clone(),
        scheduler.clone(),
        collaborators,
        clock.clone(),
    );
    if let Err(e) = fallback.initialize_fallback_pool().await {
        warn!("could not initialize the fallback pool: {e}");
    }

    let monitor = MonitorHandle::spawn(
        DeliveryMonitor::new(
            config.monitor.clone(),
            config.timezone,
            store.clone(),
            queues.clone(),
            clock.clone(),
        ),
        publisher.clone(),
    );

    let notifier = (!config.alerts.is_empty())
        .then(|| AlertHandle::spawn(AlertManager::new(config.alerts.clone()), publisher.subscribe()));
    if let (Some(notifier), Some(secs)) = (&notifier, args.mute_alerts) {
        info!("alert notifications muted for {secs}s");
        notifier.mute_alerts(secs).await;
    }

    let schedule_trigger = TriggerHandle::spawn(
        scheduler.clone(),
        config.delivery.schedule_time,
        config.timezone,
        clock.clone(),
    );
    let fallback_trigger = TriggerHandle::spawn(
        fallback.clone(),
        config.fallback.cutoff_time,
        config.timezone,
        clock.clone(),
    );

    info!(
        timezone = %config.timezone,
        next_schedule = %schedule_trigger.next_run().await?,
        next_fallback = %fallback_trigger.next_run().await?,
        "dispatch hub running"
    );

    if args.schedule_now {
        if let Err(e) = schedule_trigger.run_now().await {
            error!("{e:#}");
        }
    }
    if args.fallback_now {
        if let Err(e) = fallback_trigger.run_now().await {
            error!("{e:#}");
        }
    }

    let mut dashboards = monitor.subscribe_dashboard();
    let dashboard_log = tokio::spawn(async move {
        loop {
            match dashboards.recv().await {
                Ok(dashboard) => debug!(
                    health = dashboard.health.score,
                    sla = dashboard.sla.current,
                    delivered = dashboard.delivery.delivered,
                    failed = dashboard.delivery.failed,
                    "dashboard updated"
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    schedule_trigger.shutdown().await.ok();
    fallback_trigger.shutdown().await.ok();
    monitor.shutdown().await.ok();
    if let Some(notifier) = notifier {
        notifier.shutdown().await;
    }
    dashboard_log.abort();
    queues.shutdown().await;
    if let Err(e) = store.close().await {
        error!("failed to close storage: {e}");
    }

    Ok(())
}
