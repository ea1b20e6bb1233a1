//! Relay Worker - Publish Job Runner
//!
//! Consumes queued jobs from the Redis job stream and runs the publish job
//! for each one, delivering captured events to the AMQP broker.
//!
//! ## Configuration
//!
//! - `RELAY_CONFIG`: path to the TOML config (default: `config/relay.toml`)
//! - `REDIS_URL`: overrides `redis.url`
//! - `RELAY_WORKER_NAME`: unique worker identifier (default: hostname or UUID)
//! - `RELAY_CONSUMER_GROUP`: overrides `worker.consumer_group`
//! - `RUST_LOG`: logging level (default: "info")

use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Runtime};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_relay::config::ServiceConfig;
use event_relay::job::PublishJob;
use event_relay::publisher::BrokerPublisher;
use event_relay::queue::{parse_autoclaim_reply, QueuedJob, StreamEntry, JOB_STREAM_NAME};
use event_relay::settings::resolver::migrate_legacy_enabled;
use event_relay::settings::{ConfigResolver, RedisSettingStore};
use event_relay::shutdown::ShutdownSignal;
use event_relay::PUBLISH_JOB;

/// Idle time threshold for claiming pending jobs (in milliseconds)
const PENDING_IDLE_THRESHOLD_MS: u64 = 30000;

/// How often a running worker looks for stalled jobs
const CLAIM_INTERVAL: Duration = Duration::from_millis(PENDING_IDLE_THRESHOLD_MS);

/// Block time for a single stream read (in milliseconds)
const READ_BLOCK_MS: usize = 2000;

/// Get the worker name from environment, config or generate one.
fn get_worker_name(config: &ServiceConfig) -> String {
    if let Ok(name) = env::var("RELAY_WORKER_NAME") {
        return name;
    }
    if let Some(name) = &config.worker.name {
        return name.clone();
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Upper bound on `XAUTOCLAIM` pages walked per recovery pass
const MAX_CLAIM_PAGES: usize = 50;

/// Claim jobs pending for longer than the idle threshold, from any consumer
/// of the group including this one, and return them so they run next.
async fn claim_pending_jobs(
    conn: &mut deadpool_redis::Connection,
    consumer_group: &str,
    worker_name: &str,
) -> Vec<StreamEntry> {
    let mut claimed = Vec::new();
    let mut cursor = "0-0".to_string();

    for _ in 0..MAX_CLAIM_PAGES {
        let result: Result<RedisValue, _> = cmd("XAUTOCLAIM")
            .arg(JOB_STREAM_NAME)
            .arg(consumer_group)
            .arg(worker_name)
            .arg(PENDING_IDLE_THRESHOLD_MS)
            .arg(&cursor)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut *conn)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                // XAUTOCLAIM needs Redis 6.2+
                warn!(error = %e, "XAUTOCLAIM failed, skipping pending recovery");
                break;
            }
        };

        let Some(page) = parse_autoclaim_reply(&reply) else {
            warn!("Unexpected XAUTOCLAIM reply, skipping pending recovery");
            break;
        };

        claimed.extend(page.entries);
        if page.next_id == "0-0" {
            break;
        }
        cursor = page.next_id;
    }

    if !claimed.is_empty() {
        info!(count = claimed.len(), "Claimed pending jobs");
    }
    claimed
}

/// Run one stream entry. Returns true when a publish job ran.
async fn run_entry(job: &PublishJob, id: &str, map: &HashMap<String, RedisValue>) -> bool {
    let Some(queued) = QueuedJob::from_stream_fields(map) else {
        warn!(id = %id, "Skipping unparseable job");
        return false;
    };

    if queued.job_type != PUBLISH_JOB {
        warn!(id = %id, job_type = %queued.job_type, "Skipping unknown job type");
        return false;
    }

    debug!(id = %id, "Running publish job");
    job.run(queued.argument).await;
    true
}

async fn ack(conn: &mut deadpool_redis::Connection, consumer_group: &str, id: &str) {
    let ack_result: Result<(), _> = conn.xack(JOB_STREAM_NAME, consumer_group, &[id]).await;
    if let Err(e) = ack_result {
        error!(id = %id, error = %e, "Failed to ACK job");
    }
}

/// Claim, run and acknowledge stalled jobs. Returns (run, skipped) counts.
async fn recover_pending(
    conn: &mut deadpool_redis::Connection,
    job: &PublishJob,
    consumer_group: &str,
    worker_name: &str,
) -> (u64, u64) {
    let mut run = 0;
    let mut skipped = 0;
    for (id, map) in claim_pending_jobs(conn, consumer_group, worker_name).await {
        if run_entry(job, &id, &map).await {
            run += 1;
        } else {
            skipped += 1;
        }
        ack(conn, consumer_group, &id).await;
    }
    (run, skipped)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::load()?;

    let worker_name = get_worker_name(&config);
    let consumer_group =
        env::var("RELAY_CONSUMER_GROUP").unwrap_or_else(|_| config.worker.consumer_group.clone());
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());

    info!(
        worker_name = %worker_name,
        consumer_group = %consumer_group,
        "Relay worker starting"
    );

    let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

    let store = Arc::new(RedisSettingStore::new(pool.clone()));
    migrate_legacy_enabled(store.as_ref()).await;

    let resolver = ConfigResolver::new(store);
    let publisher = BrokerPublisher::from_runtime(resolver.clone());
    if !publisher.is_available() {
        warn!("Built without AMQP support, queued events will be dropped");
    }
    let job = PublishJob::new(resolver, publisher);

    let mut conn = pool.get().await?;

    let create_group_result: Result<(), _> = cmd("XGROUP")
        .arg("CREATE")
        .arg(JOB_STREAM_NAME)
        .arg(&consumer_group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await;

    match create_group_result {
        Ok(_) => info!(consumer_group = %consumer_group, "Created consumer group"),
        Err(e) if e.to_string().contains("BUSYGROUP") => {
            info!(consumer_group = %consumer_group, "Consumer group already exists")
        }
        Err(e) => {
            error!(error = %e, "Failed to create consumer group");
            return Err(e.into());
        }
    }

    let mut jobs_run: u64 = 0;
    let mut jobs_skipped: u64 = 0;

    let (run, skipped) = recover_pending(&mut conn, &job, &consumer_group, &worker_name).await;
    jobs_run += run;
    jobs_skipped += skipped;
    let mut last_claim = Instant::now();

    drop(conn);

    let shutdown = ShutdownSignal::new();
    let mut shutdown_receiver = shutdown.subscribe();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.listen().await });
    }

    info!(stream = %JOB_STREAM_NAME, "Listening for jobs");

    loop {
        let mut conn = match pool.get().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to get Redis connection");
                tokio::select! {
                    _ = shutdown_receiver.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        // Picks up jobs of crashed workers, and this worker's own after a restart
        if last_claim.elapsed() >= CLAIM_INTERVAL {
            let (run, skipped) =
                recover_pending(&mut conn, &job, &consumer_group, &worker_name).await;
            jobs_run += run;
            jobs_skipped += skipped;
            last_claim = Instant::now();
        }

        let opts = StreamReadOptions::default()
            .group(&consumer_group, &worker_name)
            .block(READ_BLOCK_MS)
            .count(config.worker.batch_size);

        let result: Result<StreamReadReply, _> = tokio::select! {
            _ = shutdown_receiver.recv() => {
                info!("Shutdown signal received during read");
                break;
            }
            result = conn.xread_options(&[JOB_STREAM_NAME], &[">"], &opts) => result,
        };

        match result {
            Ok(reply) => {
                // The batch is finished even if shutdown arrives meanwhile
                for stream_key in reply.keys {
                    for element in stream_key.ids {
                        if run_entry(&job, &element.id, &element.map).await {
                            jobs_run += 1;
                        } else {
                            jobs_skipped += 1;
                        }
                        // Always ACK: publish failures are logged, never retried
                        ack(&mut conn, &consumer_group, &element.id).await;

                        if jobs_run > 0 && jobs_run % 100 == 0 {
                            info!(jobs_run, jobs_skipped, "Worker statistics");
                        }
                    }
                }
            }
            Err(e) => {
                let err_str = e.to_string();
                if !err_str.contains("timed out") && !err_str.contains("response was nil") {
                    warn!(error = %e, "Stream read error");
                }
            }
        }
    }

    info!(jobs_run, jobs_skipped, "Worker shutdown complete");
    Ok(())
}
