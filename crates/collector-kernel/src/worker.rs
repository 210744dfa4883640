//! Worker supervisor
//!
//! Every periodic component of the kernel implements [`PeriodicJob`] and is
//! driven by a [`Supervisor`]: a ticker per job, each cycle run in its own
//! task so a panic is contained to that cycle, capped exponential backoff
//! after consecutive failures, and a health snapshot per job.
//!
//! Shutdown cancels the tickers. A cycle that is already running is allowed
//! to finish; units interrupted any other way are recovered by the reclaimer.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// A unit of periodic work
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> String;

    fn interval(&self) -> Duration;

    /// One cycle. Errors are logged by the supervisor and trigger backoff.
    async fn run_once(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    BackingOff,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub name: String,
    pub state: WorkerState,
    pub cycles: u64,
    pub failures: u64,
    pub panics: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WorkerHealth {
    fn new(name: String) -> Self {
        Self {
            name,
            state: WorkerState::Idle,
            cycles: 0,
            failures: 0,
            panics: 0,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
        }
    }
}

/// Extra delay after `consecutive_failures` failed cycles in a row
pub fn backoff_delay(interval: Duration, consecutive_failures: u32, max: Duration) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32 << (consecutive_failures - 1).min(16);
    interval.saturating_mul(factor).min(max)
}

type HealthMap = Arc<RwLock<BTreeMap<String, WorkerHealth>>>;

pub struct Supervisor {
    token: CancellationToken,
    health: HealthMap,
    handles: Vec<JoinHandle<()>>,
    max_backoff: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS))
    }
}

impl Supervisor {
    pub fn new(max_backoff: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            health: Arc::new(RwLock::new(BTreeMap::new())),
            handles: Vec::new(),
            max_backoff,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn spawn(&mut self, job: Arc<dyn PeriodicJob>) {
        let name = job.name();
        self.health
            .write()
            .await
            .insert(name.clone(), WorkerHealth::new(name.clone()));

        let token = self.token.child_token();
        let health = self.health.clone();
        let max_backoff = self.max_backoff;

        info!(worker = %name, interval = ?job.interval(), "Starting worker");
        self.handles.push(tokio::spawn(async move {
            supervise(name, job, token, health, max_backoff).await;
        }));
    }

    /// Per-job health, ordered by name
    pub async fn health(&self) -> Vec<WorkerHealth> {
        self.health.read().await.values().cloned().collect()
    }

    /// Stop all tickers and wait for the running cycles to finish
    pub async fn shutdown(self) {
        info!(workers = self.handles.len(), "Stopping workers");
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
    }
}

async fn update(health: &HealthMap, name: &str, f: impl FnOnce(&mut WorkerHealth)) {
    if let Some(entry) = health.write().await.get_mut(name) {
        f(entry);
    }
}

async fn supervise(
    name: String,
    job: Arc<dyn PeriodicJob>,
    token: CancellationToken,
    health: HealthMap,
    max_backoff: Duration,
) {
    let interval = job.interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        update(&health, &name, |h| h.state = WorkerState::Running).await;

        let cycle_job = job.clone();
        let outcome = tokio::spawn(async move { cycle_job.run_once().await }).await;

        let mut consecutive = 0;
        match outcome {
            Ok(Ok(())) => {
                debug!(worker = %name, "Cycle completed");
                update(&health, &name, |h| {
                    h.cycles += 1;
                    h.consecutive_failures = 0;
                    h.last_success = Some(Utc::now());
                    h.state = WorkerState::Idle;
                })
                .await;
            }
            Ok(Err(e)) => {
                error!(worker = %name, "Cycle failed: {:#}", e);
                let message = format!("{:#}", e);
                update(&health, &name, |h| {
                    h.cycles += 1;
                    h.failures += 1;
                    h.consecutive_failures += 1;
                    h.last_error = Some(message);
                    consecutive = h.consecutive_failures;
                })
                .await;
            }
            Err(e) => {
                error!(worker = %name, "Cycle panicked: {}", e);
                let message = e.to_string();
                update(&health, &name, |h| {
                    h.cycles += 1;
                    h.panics += 1;
                    h.consecutive_failures += 1;
                    h.last_error = Some(message);
                    consecutive = h.consecutive_failures;
                })
                .await;
            }
        }

        let delay = backoff_delay(interval, consecutive, max_backoff);
        if !delay.is_zero() {
            warn!(worker = %name, consecutive_failures = consecutive, delay = ?delay, "Backing off");
            update(&health, &name, |h| h.state = WorkerState::BackingOff).await;
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            update(&health, &name, |h| h.state = WorkerState::Idle).await;
        }
    }

    update(&health, &name, |h| h.state = WorkerState::Stopped).await;
    info!(worker = %name, "Worker stopped");
}
