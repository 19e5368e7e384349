// ── Recall: Extraction Queue ────────────────────────────────────────────────
//
// Owned replacement for fire-and-forget extraction. A dispatcher task drains
// an unbounded channel; each memory runs on its own task under a shared
// ConcurrencyLimiter. A `Failed` outcome is retried after exponential backoff
// (the permit is released while sleeping) until `max_attempts` is reached.
// An id already queued or running is not scheduled twice.
//
// Callers observe completion by polling `ExtractionStore::extraction_status`.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::recall_types::ExtractionConfig;
use crate::engine::limiter::ConcurrencyLimiter;
use crate::engine::recall::extraction::{EntityExtractionWorker, ExtractionOutcome};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Total attempts per submission, first run included.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    /// Memories processed at once.
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        ExtractionConfig::default().into()
    }
}

impl From<ExtractionConfig> for QueueConfig {
    fn from(c: ExtractionConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            retry_base_ms: c.retry_base_ms,
            concurrency: c.concurrency.max(1),
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `retry` (1-based): base · 2^(retry-1).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_ms.saturating_mul(1u64 << exp))
    }
}

pub struct ExtractionQueue {
    tx: mpsc::UnboundedSender<String>,
    dispatcher: JoinHandle<()>,
}

impl ExtractionQueue {
    /// Spawn the dispatcher. Must be called inside a tokio runtime.
    pub fn start(worker: Arc<EntityExtractionWorker>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(worker, config, rx));
        Self { tx, dispatcher }
    }

    /// Enqueue a memory for extraction.
    pub fn submit(&self, memory_id: impl Into<String>) -> EngineResult<()> {
        let memory_id = memory_id.into();
        debug!("[recall:extract] Queued {}", memory_id);
        self.tx
            .send(memory_id)
            .map_err(|e| EngineError::Other(format!("extraction queue is shut down, dropped {}", e.0)))
    }

    /// Stop accepting work and wait for every queued job, retries included.
    pub async fn shutdown(self) {
        let Self { tx, dispatcher } = self;
        drop(tx);
        if let Err(e) = dispatcher.await {
            error!("[recall:extract] Queue dispatcher ended abnormally: {}", e);
        }
        info!("[recall:extract] Extraction queue drained");
    }
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Removes its id from the in-flight set when the job ends, panics included.
struct InFlightGuard {
    in_flight: InFlight,
    memory_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.memory_id);
    }
}

async fn dispatch(worker: Arc<EntityExtractionWorker>, config: QueueConfig, mut rx: mpsc::UnboundedReceiver<String>) {
    let limiter = ConcurrencyLimiter::new(config.concurrency);
    let config = Arc::new(config);
    let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
    let mut jobs: Vec<JoinHandle<()>> = Vec::new();

    while let Some(memory_id) = rx.recv().await {
        if !in_flight.lock().insert(memory_id.clone()) {
            debug!("[recall:extract] {} already queued, merging submission", memory_id);
            continue;
        }
        let guard = InFlightGuard { in_flight: in_flight.clone(), memory_id: memory_id.clone() };
        let (worker, limiter, config) = (worker.clone(), limiter.clone(), config.clone());
        jobs.retain(|j| !j.is_finished());
        jobs.push(tokio::spawn(async move {
            let _guard = guard;
            run_job(worker, limiter, config, memory_id).await;
        }));
    }

    for job in jobs {
        if let Err(e) = job.await {
            error!("[recall:extract] Extraction job panicked: {}", e);
        }
    }
}

async fn run_job(
    worker: Arc<EntityExtractionWorker>,
    limiter: ConcurrencyLimiter,
    config: Arc<QueueConfig>,
    memory_id: String,
) {
    let mut attempt = 1;
    loop {
        let outcome = limiter.run(|| worker.process(&memory_id)).await;
        match outcome {
            ExtractionOutcome::Failed { error } if attempt < config.max_attempts => {
                let delay = config.retry_delay(attempt);
                warn!(
                    "[recall:extract] Attempt {}/{} for {} failed ({}), retrying in {:?}",
                    attempt, config.max_attempts, memory_id, error, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            ExtractionOutcome::Failed { error } => {
                error!(
                    "[recall:extract] Giving up on {} after {} attempts: {}",
                    memory_id, attempt, error
                );
                return;
            }
            other => {
                debug!("[recall:extract] {} finished: {:?}", memory_id, other);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        let config = QueueConfig { max_attempts: 3, retry_base_ms: 500, concurrency: 1 };
        assert_eq!(config.retry_delay(1), Duration::from_millis(500));
        assert_eq!(config.retry_delay(2), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_in_flight_guard_releases_id() {
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        assert!(in_flight.lock().insert("m1".to_string()));
        let guard = InFlightGuard { in_flight: in_flight.clone(), memory_id: "m1".into() };
        assert!(!in_flight.lock().insert("m1".to_string()));
        drop(guard);
        assert!(in_flight.lock().is_empty());
    }

    #[test]
    fn test_defaults_follow_extraction_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_base_ms, 500);
        assert_eq!(config.concurrency, 4);
    }
}
