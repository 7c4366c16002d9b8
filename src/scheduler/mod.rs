//! Connection Scheduler (§4.3) — bounded-concurrency wave bring-up for a
//! batch of [`ManagedClient`]s, with a retry queue and aggregate metrics.
//!
//! Grounded on the `tokio::task::JoinSet` fan-out pattern shown in the
//! pack's `codex_mcp_connection_manager` reference file, generalized from
//! "all at once" to a fixed worker pool draining two bounded
//! `tokio::sync::mpsc` channels (primary, retry) with `biased` `select!`
//! so a worker always prefers a fresh job over a retry when both are
//! ready (spec.md §4.3 "Ordering & fairness").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::upstream::client::ManagedClient;

/// Queues are buffered at at least this depth (spec.md §4.3 "Model").
const MIN_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size. Zero maps to the default of 10 (spec.md: "negative/zero
    /// → default"; this crate's config is unsigned, so only the zero case applies).
    pub workers: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt timeout wrapped around each connect+discover call.
    pub connect_timeout: Duration,
    /// Upper bound `Stop()` waits for in-flight workers to exit.
    pub shutdown_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(requested: usize) -> Self {
        Self {
            workers: if requested == 0 { 10 } else { requested },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerResult {
    pub duration_ms: u64,
    pub total_jobs: usize,
    pub successful: usize,
    pub failed: usize,
    pub retried: usize,
}

#[derive(Clone)]
struct Job {
    client: Arc<ManagedClient>,
    attempt: u32,
}

/// A fixed worker pool bringing up clients under a global concurrency cap
/// (spec.md §4.3). One `Scheduler` instance is long-lived for the process;
/// `start()` is called once per wave (startup, and again whenever
/// reconciliation admits newly added servers).
pub struct Scheduler {
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    fn effective_workers(&self) -> usize {
        self.config.workers.max(1)
    }

    /// `Start(clients)` (§4.3 step 1-5): enable startup mode on every
    /// client, enqueue them all on the primary queue, and join on
    /// completion. Returns the aggregate result once every job has
    /// either succeeded or exhausted its retries.
    pub async fn start(&self, clients: Vec<Arc<ManagedClient>>) -> SchedulerResult {
        let total = clients.len();
        let started = Instant::now();
        if total == 0 {
            return SchedulerResult::default();
        }

        for client in &clients {
            client.set_startup_mode_suspended(true).await;
        }

        let queue_capacity = total.max(MIN_QUEUE_CAPACITY);
        let (primary_tx, primary_rx) = mpsc::channel::<Job>(queue_capacity);
        let (retry_tx, retry_rx) = mpsc::channel::<Job>(queue_capacity);
        let primary_rx = Arc::new(Mutex::new(primary_rx));
        let retry_rx = Arc::new(Mutex::new(retry_rx));

        for client in &clients {
            let _ = primary_tx
                .send(Job {
                    client: client.clone(),
                    attempt: 0,
                })
                .await;
        }

        let successful = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let retried = Arc::new(AtomicUsize::new(0));
        let remaining = Arc::new(AtomicUsize::new(total));
        let done = Arc::new(Notify::new());

        let wave_cancel = self.cancel.child_token();
        let mut workers = JoinSet::new();
        for _ in 0..self.effective_workers() {
            workers.spawn(worker_loop(
                primary_rx.clone(),
                retry_rx.clone(),
                retry_tx.clone(),
                wave_cancel.clone(),
                self.config.clone(),
                successful.clone(),
                failed.clone(),
                retried.clone(),
                remaining.clone(),
                done.clone(),
            ));
        }

        loop {
            if remaining.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = done.notified() => {}
                _ = wave_cancel.cancelled() => break,
            }
        }
        wave_cancel.cancel();
        while workers.join_next().await.is_some() {}

        for client in &clients {
            client.finalize_after_wave().await;
        }

        let result = SchedulerResult {
            duration_ms: started.elapsed().as_millis() as u64,
            total_jobs: total,
            successful: successful.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
            retried: retried.load(Ordering::SeqCst),
        };

        tracing::info!(
            total = result.total_jobs,
            successful = result.successful,
            failed = result.failed,
            retried = result.retried,
            duration_ms = result.duration_ms,
            "scheduler wave complete"
        );
        result
    }

    /// Cancel in-flight connects and stop admitting new jobs. Idempotent
    /// (spec.md §8 property 9) — `CancellationToken::cancel` already is.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    primary_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    retry_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    retry_tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
    config: SchedulerConfig,
    successful: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    retried: Arc<AtomicUsize>,
    remaining: Arc<AtomicUsize>,
    done: Arc<Notify>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            maybe = async { primary_rx.lock().await.recv().await } => maybe,
            maybe = async { retry_rx.lock().await.recv().await } => maybe,
        };
        let Some(job) = job else {
            return;
        };

        if cancel.is_cancelled() {
            remaining.fetch_sub(1, Ordering::SeqCst);
            done.notify_waiters();
            continue;
        }

        let attempt = job.attempt;
        let result = tokio::time::timeout(config.connect_timeout, job.client.connect_and_discover()).await;

        match result {
            Ok(Ok(())) => {
                successful.fetch_add(1, Ordering::SeqCst);
                remaining.fetch_sub(1, Ordering::SeqCst);
                done.notify_waiters();
            }
            _ => {
                if attempt < config.max_retries {
                    retried.fetch_add(1, Ordering::SeqCst);
                    let backoff = backoff_for(attempt, config.base_backoff, config.max_backoff);
                    let next = Job {
                        client: job.client,
                        attempt: attempt + 1,
                    };
                    let retry_tx = retry_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        let _ = retry_tx.send(next).await;
                    });
                } else {
                    failed.fetch_add(1, Ordering::SeqCst);
                    remaining.fetch_sub(1, Ordering::SeqCst);
                    done.notify_waiters();
                }
            }
        }
    }
}

fn backoff_for(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let exponential = base.saturating_mul(factor).min(cap);
    // Full jitter (0..=exponential) so a batch of simultaneously-failing
    // retries doesn't all wake up and re-hit the same host at once.
    let millis = exponential.as_millis().min(u128::from(u64::MAX)) as u64;
    if millis == 0 {
        return exponential;
    }
    Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 0..=millis))
}
