//! Per-image sandbox pool.
//!
//! A pool is a bounded set of idle, pre-warmed sandbox handles for one
//! image. `acquire` leases a handle (FIFO among waiters), `release` returns
//! it or destroys it, and a serialized background task replenishes the pool
//! back to its target size after every destruction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};

use sandpool_core::{Error, Result};
use sandpool_sandbox::image::backoff_delay;
use sandpool_sandbox::{ImageResolver, SandboxFactory, SandboxHandle};

use crate::metrics::Metrics;

/// Pause after three consecutive replenishment failures.
const REPLENISH_PAUSE: Duration = Duration::from_secs(10);
/// Consecutive failures tolerated before pausing.
const REPLENISH_FAILURE_LIMIT: u32 = 3;
/// Poll interval while draining waits for in-flight handles.
const DRAIN_POLL: Duration = Duration::from_millis(100);
/// Extra wait after canceling in-flight executions; covers the engine's
/// SIGTERM-grace-SIGKILL sequence plus cleanup.
const DRAIN_CANCEL_WAIT: Duration = Duration::from_secs(10);

struct Waiter {
    id: u64,
    tx: oneshot::Sender<SandboxHandle>,
}

struct PoolState {
    idle: VecDeque<SandboxHandle>,
    in_flight: usize,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    executions: AtomicU64,
    acquire_waits: AtomicU64,
    acquire_timeouts: AtomicU64,
}

/// Point-in-time view of one pool, for metrics and tests.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub image: String,
    pub target_size: usize,
    pub idle: usize,
    pub in_flight: usize,
    pub created: u64,
    pub destroyed: u64,
    pub executions: u64,
    pub acquire_waits: u64,
    pub acquire_timeouts: u64,
}

/// A bounded pool of idle sandboxes for one image.
pub struct Pool {
    name: String,
    image: String,
    target_size: usize,
    state: Mutex<PoolState>,
    closed: AtomicBool,
    // Flips to true when a drain runs out of grace; leased executions watch
    // it through the engine and stop their scripts.
    cancel_tx: watch::Sender<bool>,
    next_waiter: AtomicU64,
    // Serializes the background replenishment loop per pool.
    replenish_gate: tokio::sync::Mutex<()>,
    counters: PoolCounters,
    resolver: Arc<ImageResolver>,
    factory: Arc<SandboxFactory>,
    metrics: Arc<Metrics>,
}

impl Pool {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        target_size: usize,
        resolver: Arc<ImageResolver>,
        factory: Arc<SandboxFactory>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            image: image.into(),
            target_size: target_size.max(1),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_flight: 0,
                waiters: VecDeque::new(),
            }),
            closed: AtomicBool::new(false),
            cancel_tx,
            next_waiter: AtomicU64::new(0),
            replenish_gate: tokio::sync::Mutex::new(()),
            counters: PoolCounters::default(),
            resolver,
            factory,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical image this pool serves.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Cancellation signal handed to every execution leasing from this
    /// pool; fires when a drain exhausts its grace.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Lease an idle sandbox, waiting up to `timeout` for one to free up.
    ///
    /// Waiters are served strictly in arrival order. Acquire never creates
    /// containers itself; replenishment catches the pool up in the
    /// background.
    pub async fn acquire(&self, timeout: Duration) -> Result<SandboxHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let (waiter_id, mut rx) = {
            let mut state = self.state.lock().unwrap();
            if let Some(handle) = state.idle.pop_front() {
                state.in_flight += 1;
                return Ok(handle);
            }
            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter.fetch_add(1, Ordering::SeqCst);
            state.waiters.push_back(Waiter { id, tx });
            self.counters.acquire_waits.fetch_add(1, Ordering::Relaxed);
            (id, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            // A releaser handed us a handle; it already counted us in-flight.
            Ok(Ok(handle)) => Ok(handle),
            // Sender dropped: a drain started while we were parked.
            Ok(Err(_)) => Err(Error::Canceled("pool is draining".into())),
            Err(_) => {
                let still_waiting = {
                    let mut state = self.state.lock().unwrap();
                    match state.waiters.iter().position(|w| w.id == waiter_id) {
                        Some(pos) => {
                            state.waiters.remove(pos);
                            true
                        }
                        None => false,
                    }
                };
                if still_waiting {
                    self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc_pool_acquire_timeouts();
                    Err(Error::PoolExhausted {
                        pool: self.name.clone(),
                    })
                } else {
                    // Lost the race with a release: the handle was already
                    // sent (sends happen under the state lock).
                    match rx.try_recv() {
                        Ok(handle) => Ok(handle),
                        Err(_) => Err(Error::PoolExhausted {
                            pool: self.name.clone(),
                        }),
                    }
                }
            }
        }
    }

    /// Return a leased handle. Clean handles go back to the idle set (or
    /// straight to the oldest waiter); everything else is destroyed and
    /// replenishment is scheduled.
    pub async fn release(self: &Arc<Self>, handle: SandboxHandle, clean: bool) {
        let closed = self.closed.load(Ordering::SeqCst);

        if clean && !closed {
            let mut state = self.state.lock().unwrap();
            state.in_flight -= 1;
            Self::hand_back(&mut state, handle);
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.in_flight -= 1;
        }
        self.destroy_handle(&handle).await;
        if !closed {
            self.spawn_replenish();
        }
    }

    /// Count one execution routed through this pool.
    pub fn record_execution(&self) {
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Give a handle to the oldest live waiter, or park it in the idle set.
    fn hand_back(state: &mut PoolState, mut handle: SandboxHandle) {
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(handle) {
                Ok(()) => {
                    state.in_flight += 1;
                    return;
                }
                // Waiter gave up (timed out); try the next one.
                Err(returned) => handle = returned,
            }
        }
        state.idle.push_back(handle);
    }

    /// Kick the background replenishment task. Safe to call repeatedly: runs
    /// are serialized per pool and each run tops the pool up to target.
    pub fn spawn_replenish(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.replenish().await;
        });
    }

    async fn replenish(&self) {
        let _gate = self.replenish_gate.lock().await;
        let mut consecutive_failures = 0u32;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let deficit = {
                let state = self.state.lock().unwrap();
                self.target_size
                    .saturating_sub(state.idle.len() + state.in_flight)
            };
            if deficit == 0 {
                return;
            }

            match self.create_one().await {
                Ok(handle) => {
                    consecutive_failures = 0;
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc_containers_created();

                    let surplus = {
                        let mut state = self.state.lock().unwrap();
                        if self.closed.load(Ordering::SeqCst)
                            || state.idle.len() + state.in_flight >= self.target_size
                        {
                            // A release beat us to the slot; drop the extra
                            // so the bound holds.
                            Some(handle)
                        } else {
                            Self::hand_back(&mut state, handle);
                            None
                        }
                    };
                    if let Some(extra) = surplus {
                        self.destroy_handle(&extra).await;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        pool = %self.name,
                        image = %self.image,
                        failures = consecutive_failures,
                        error = %e,
                        "Pool replenishment failed"
                    );
                    if matches!(e, Error::ImagePull(_) | Error::ImageResolve(_)) {
                        self.metrics.inc_image_pull_failures();
                    }
                    if consecutive_failures >= REPLENISH_FAILURE_LIMIT {
                        tracing::warn!(
                            pool = %self.name,
                            pause_secs = REPLENISH_PAUSE.as_secs(),
                            "Pausing replenishment after repeated failures"
                        );
                        tokio::time::sleep(REPLENISH_PAUSE).await;
                        consecutive_failures = 0;
                    } else {
                        tokio::time::sleep(backoff_delay(consecutive_failures)).await;
                    }
                }
            }
        }
    }

    async fn create_one(&self) -> Result<SandboxHandle> {
        if self.resolver.ensure(&self.image).await? {
            self.metrics.inc_image_pulls();
        }
        self.factory.create(&self.image, Some(&self.name)).await
    }

    async fn destroy_handle(&self, handle: &SandboxHandle) {
        self.factory.destroy(handle).await;
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_containers_destroyed();
    }

    /// Stop accepting acquires, destroy idle handles, and wait up to `grace`
    /// for leased handles to come back (they are destroyed on release once
    /// the pool is closed). Executions that outlive the grace are canceled
    /// through [`Self::cancel_signal`], which stops the in-container process
    /// and brings the handle back tainted.
    pub async fn drain(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!(pool = %self.name, "Draining pool");

        let (idle, waiters) = {
            let mut state = self.state.lock().unwrap();
            (
                state.idle.drain(..).collect::<Vec<_>>(),
                state.waiters.drain(..).collect::<Vec<_>>(),
            )
        };
        // Dropping the senders wakes every waiter with a shutdown error.
        drop(waiters);

        for handle in &idle {
            self.destroy_handle(handle).await;
        }

        if self.wait_in_flight(grace).await {
            tracing::info!(pool = %self.name, "Pool drained");
            return;
        }

        let in_flight = self.state.lock().unwrap().in_flight;
        tracing::warn!(
            pool = %self.name,
            in_flight,
            "Drain grace elapsed, canceling in-flight executions"
        );
        let _ = self.cancel_tx.send(true);

        if self.wait_in_flight(DRAIN_CANCEL_WAIT).await {
            tracing::info!(pool = %self.name, "Pool drained after cancellation");
        } else {
            let in_flight = self.state.lock().unwrap().in_flight;
            tracing::warn!(
                pool = %self.name,
                in_flight,
                "Handles still leased after cancellation"
            );
        }
    }

    /// Poll until no handles are leased, up to `limit`. True when the pool
    /// reached zero in-flight.
    async fn wait_in_flight(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.state.lock().unwrap().in_flight == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            name: self.name.clone(),
            image: self.image.clone(),
            target_size: self.target_size,
            idle: state.idle.len(),
            in_flight: state.in_flight,
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            executions: self.counters.executions.load(Ordering::Relaxed),
            acquire_waits: self.counters.acquire_waits.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
        }
    }
}
