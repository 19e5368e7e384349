// ── factgraph Engine: Concurrency Limiter ──────────────────────────────────
//
// Bounds the number of simultaneous async operations (LLM fan-out during
// rerank and extraction). Strict FIFO: waiters are queued in arrival order and
// a released permit is handed directly to the head waiter; the free count only
// grows when nobody is waiting. No timeouts, no priorities.
//
// Permits are RAII guards, so `run()` releases on success, on `Err`, and on
// panic unwinding alike.

use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

struct LimiterState {
    available: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct LimiterInner {
    capacity: usize,
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    /// Hand the slot to the first live waiter, or return it to the pool.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
            // Waiter gave up before we got to it; try the next one.
        }
        state.available = (state.available + 1).min(self.capacity);
    }
}

/// FIFO counting limiter. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter with `capacity` permits (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(LimiterInner {
                capacity,
                state: Mutex::new(LimiterState {
                    available: capacity,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Callers currently suspended in `acquire`.
    pub fn waiting(&self) -> usize {
        self.inner
            .state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    /// Take a permit, suspending in FIFO order while none is free.
    pub async fn acquire(&self) -> LimiterPermit {
        loop {
            let rx = {
                let mut state = self.inner.state.lock();
                if state.available > 0 {
                    state.available -= 1;
                    return LimiterPermit::new(self.inner.clone());
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut wait = PendingWait { rx, inner: &self.inner, settled: false };
            let outcome = (&mut wait.rx).await;
            wait.settled = true;
            match outcome {
                Ok(()) => return LimiterPermit::new(self.inner.clone()),
                // Sender dropped without a hand-off; queue up again.
                Err(_) => debug!("[limiter] Waiter woken without permit, re-queueing"),
            }
        }
    }

    /// Acquire, run `f`, release on every exit path.
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }
}

/// Guard for a suspended `acquire`. If the acquiring future is dropped after a
/// permit was handed to it but before it observed the hand-off, the permit is
/// passed on instead of leaking.
struct PendingWait<'a> {
    rx: oneshot::Receiver<()>,
    inner: &'a Arc<LimiterInner>,
    settled: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.inner.release_slot();
        }
    }
}

/// One held slot. Dropping it releases the slot.
pub struct LimiterPermit {
    inner: Arc<LimiterInner>,
}

impl LimiterPermit {
    fn new(inner: Arc<LimiterInner>) -> Self {
        Self { inner }
    }

    /// Explicit release; equivalent to dropping the permit.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.inner.release_slot();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
