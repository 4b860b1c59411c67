use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use switchyard::config::MatchingConfig;
use switchyard::engine::MatchingEngine;
use switchyard::metrics::{run_metrics_server, Metrics};
use switchyard::queue_id::{QueueId, QueueKind, QueueSubKind};
use switchyard::store::MemoryQueueStore;
use switchyard::task::{now_epoch_ms, PolledTask, TaskInfo};

#[derive(Parser, Debug)]
struct Args {
    /// Duration to run the simulation, in seconds
    #[arg(long, default_value = "30")]
    duration_secs: u64,
    /// Number of queue partitions (1 = just the root)
    #[arg(long, default_value = "4")]
    partitions: u32,
    /// Concurrent producers, spread across all partitions
    #[arg(long, default_value = "4")]
    producers: usize,
    /// Concurrent pollers, all on the root partition
    #[arg(long, default_value = "2")]
    pollers: usize,
    /// Pause between produced tasks per producer, in milliseconds
    #[arg(long, default_value = "10")]
    produce_interval_ms: u64,
    /// Interval for stats output in seconds
    #[arg(long, default_value = "5")]
    stats_interval_secs: u64,
    /// Path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<std::path::PathBuf>,
    /// Serve Prometheus metrics (overrides [metrics].enabled)
    #[arg(long)]
    metrics: bool,
}

#[derive(Default)]
struct SimCounters {
    produced: AtomicU64,
    produce_errors: AtomicU64,
    delivered: AtomicU64,
    sync_matched: AtomicU64,
    from_backlog: AtomicU64,
}

fn partition_queue(namespace_id: Uuid, partition: u32) -> QueueId {
    let name = if partition == 0 {
        "sim-queue".to_string()
    } else {
        format!("sim-queue/{}", partition)
    };
    QueueId::new(
        namespace_id,
        &name,
        QueueKind::Activity,
        QueueSubKind::Normal,
    )
    .expect("valid queue name")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = MatchingConfig::load(args.config.as_deref())?;
    switchyard::trace::init(config.log_format);

    let metrics = Arc::new(Metrics::new()?);
    let store = MemoryQueueStore::new();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    if args.metrics || config.metrics.enabled {
        let addr = config.metrics.addr.parse()?;
        let metrics = metrics.as_ref().clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = run_metrics_server(addr, metrics, shutdown_rx).await {
                warn!(error = %err, "metrics server exited");
            }
        });
    }

    let engine = Arc::new(MatchingEngine::new(config, store, metrics.clone()));

    let namespace_id = Uuid::new_v4();
    let counters = Arc::new(SimCounters::default());
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();

    // Pollers sit on the root; children reach them through the forwarder.
    for poller in 0..args.pollers {
        let engine = engine.clone();
        let counters = counters.clone();
        let stop = stop.clone();
        let queue = partition_queue(namespace_id, 0);
        workers.push(tokio::spawn(async move {
            let identity = format!("sim-poller-{}", poller);
            while !stop.load(Ordering::Relaxed) {
                match engine
                    .poll_for_activity_task(queue.clone(), &identity, "", Duration::from_secs(1))
                    .await
                {
                    Ok(Some(PolledTask::Task { task_id, .. })) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                        match task_id {
                            None => counters.sync_matched.fetch_add(1, Ordering::Relaxed),
                            Some(_) => counters.from_backlog.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "poll failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }));
    }

    for producer in 0..args.producers {
        let engine = engine.clone();
        let counters = counters.clone();
        let stop = stop.clone();
        let partitions = args.partitions.max(1);
        let interval = Duration::from_millis(args.produce_interval_ms);
        workers.push(tokio::spawn(async move {
            let mut sequence: i64 = 0;
            while !stop.load(Ordering::Relaxed) {
                let partition = rand::thread_rng().gen_range(0..partitions);
                let queue = partition_queue(namespace_id, partition);
                sequence += 1;
                let info = TaskInfo {
                    namespace_id,
                    workflow_id: format!("sim-wf-{}-{}", producer, sequence),
                    run_id: Uuid::new_v4().to_string(),
                    schedule_id: sequence,
                    created_at_ms: now_epoch_ms(),
                    expiry_ms: 0,
                };
                match engine.add_activity_task(queue, info, "").await {
                    Ok(()) => {
                        counters.produced.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        counters.produce_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %err, "add failed");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_secs);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval_secs.max(1)));
    ticker.tick().await;
    while Instant::now() < deadline {
        tokio::select! {
            _ = ticker.tick() => {
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    produced = counters.produced.load(Ordering::Relaxed),
                    delivered = counters.delivered.load(Ordering::Relaxed),
                    sync_matched = counters.sync_matched.load(Ordering::Relaxed),
                    from_backlog = counters.from_backlog.load(Ordering::Relaxed),
                    "sim progress"
                );
            }
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        let _ = worker.await;
    }
    engine.stop().await;
    let _ = shutdown_tx.send(());

    let produced = counters.produced.load(Ordering::Relaxed);
    let delivered = counters.delivered.load(Ordering::Relaxed);
    info!(
        produced,
        delivered,
        produce_errors = counters.produce_errors.load(Ordering::Relaxed),
        sync_matched = counters.sync_matched.load(Ordering::Relaxed),
        from_backlog = counters.from_backlog.load(Ordering::Relaxed),
        "sim finished"
    );
    Ok(())
}
