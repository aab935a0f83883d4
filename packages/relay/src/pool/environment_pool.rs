// packages/relay/src/pool/environment_pool.rs
//! Bounded pool of reusable environments for one bundle
//!
//! Records live in an arena of slots. Moving an environment between idle
//! and busy only moves its slot index, and the environment itself travels
//! with whoever holds it: the pool while idle, the worker while busy.
//!
//! # Lifecycle
//!
//! - `acquire`: pop an idle environment, backfill when below `max`, burst
//!   (or wait) at `max`
//! - `release`: back to idle, unless burst, retired, or the pool is closed
//! - `remove`: terminate after a failure
//! - `close`: terminate idle now, busy on release

use crate::observability::{ENVIRONMENTS_CREATED, ENVIRONMENTS_TERMINATED};
use crate::pool::{EnvironmentMaker, PoolConfig, PooledEnvironment};
use crate::utils::errors::{RelayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of environments to create when backfilling an empty idle set:
/// about a quarter of the remaining headroom, at least one.
pub fn fill_size(current: usize, max: usize) -> usize {
    let remaining = max.saturating_sub(current);
    if remaining == 0 {
        return 0;
    }
    (remaining / 4).max(1)
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub closed: bool,
}

struct EnvironmentRecord<E> {
    /// Present while idle; the worker owns it while busy
    env: Option<E>,
    env_id: String,
    uses: u32,
    last_used: Instant,
}

struct PoolState<E> {
    slots: Vec<Option<EnvironmentRecord<E>>>,
    free: Vec<usize>,
    idle: Vec<usize>,
    busy: HashMap<String, usize>,
    closed: bool,
}

impl<E: PooledEnvironment> PoolState<E> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            idle: Vec::new(),
            busy: HashMap::new(),
            closed: false,
        }
    }

    fn tracked(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    fn insert_idle(&mut self, env: E) {
        let record = EnvironmentRecord {
            env_id: env.id().to_string(),
            env: Some(env),
            uses: 0,
            last_used: Instant::now(),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(record);
                slot
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };
        self.idle.push(slot);
    }

    fn checkout(&mut self) -> Option<E> {
        while let Some(slot) = self.idle.pop() {
            let Some(record) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
                continue;
            };
            let Some(env) = record.env.take() else {
                continue;
            };
            record.uses += 1;
            record.last_used = Instant::now();
            let env_id = record.env_id.clone();
            self.busy.insert(env_id, slot);
            return Some(env);
        }
        None
    }

    fn vacate(&mut self, slot: usize) -> Option<EnvironmentRecord<E>> {
        let record = self.slots.get_mut(slot)?.take();
        if record.is_some() {
            self.free.push(slot);
        }
        record
    }

    fn drain_idle(&mut self) -> Vec<E> {
        let slots: Vec<usize> = self.idle.drain(..).collect();
        slots
            .into_iter()
            .filter_map(|slot| self.vacate(slot))
            .filter_map(|record| record.env)
            .collect()
    }
}

/// Pool of environments serving one bundle
pub struct EnvironmentPool<E> {
    bundle: String,
    config: PoolConfig,
    maker: Arc<dyn EnvironmentMaker<E>>,
    state: Mutex<PoolState<E>>,
    /// Signalled whenever tracked capacity may have freed up
    capacity: Notify,
}

impl<E: PooledEnvironment> EnvironmentPool<E> {
    /// Create a pool and fill it to `min`.
    ///
    /// If any environment fails to build, the ones already built are
    /// terminated and the error is returned.
    pub async fn new(
        bundle: impl Into<String>,
        config: PoolConfig,
        maker: Arc<dyn EnvironmentMaker<E>>,
    ) -> Result<Self> {
        let pool = Self {
            bundle: bundle.into(),
            config,
            maker,
            state: Mutex::new(PoolState::new()),
            capacity: Notify::new(),
        };

        {
            let mut state = pool.state.lock().await;
            pool.fill(&mut state, pool.config.min.min(pool.config.max)).await?;
        }

        info!(
            "Pool for {} ready with {} environments (max {})",
            pool.bundle, pool.config.min, pool.config.max
        );
        Ok(pool)
    }

    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take an environment for exclusive use
    pub async fn acquire(&self) -> Result<E> {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(RelayError::PoolClosed(self.bundle.clone()));
                }
                if let Some(env) = state.checkout() {
                    debug!("Acquired environment {} for {}", env.id(), self.bundle);
                    return Ok(env);
                }

                let tracked = state.tracked();
                if tracked < self.config.max {
                    let count = fill_size(tracked, self.config.max);
                    self.fill(&mut state, count).await?;
                    continue;
                }
            }

            if self.config.burst {
                return self.make_burst().await;
            }

            debug!("Pool for {} at capacity, waiting", self.bundle);
            notified.await;
        }
    }

    /// Return an environment after a successful execution
    pub async fn release(&self, env: E) {
        let retired = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match state.busy.remove(env.id()) {
                None => Some(env),
                Some(slot) => {
                    let closed = state.closed;
                    let ceiling = self.config.reuse_ceiling;
                    match state.slots.get_mut(slot).and_then(Option::as_mut) {
                        Some(record) if !closed && record.uses < ceiling => {
                            record.env = Some(env);
                            record.last_used = Instant::now();
                            state.idle.push(slot);
                            None
                        }
                        _ => {
                            state.vacate(slot);
                            Some(env)
                        }
                    }
                }
            }
        };

        if let Some(env) = retired {
            debug!("Retiring environment {} for {}", env.id(), self.bundle);
            self.terminate(env).await;
        }
        self.capacity.notify_one();
    }

    /// Terminate an environment that failed; it never returns to the pool
    pub async fn remove(&self, env: E) {
        {
            let mut state = self.state.lock().await;
            if let Some(slot) = state.busy.remove(env.id()) {
                state.vacate(slot);
            }
        }
        warn!("Evicting environment {} for {}", env.id(), self.bundle);
        self.terminate(env).await;
        self.capacity.notify_one();
    }

    /// Stop handing out environments and terminate the idle ones.
    ///
    /// Busy environments are terminated when they are released.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.drain_idle()
        };

        if !idle.is_empty() {
            info!("Closing pool for {}: terminating {} idle", self.bundle, idle.len());
        }
        for env in idle {
            self.terminate(env).await;
        }
        self.capacity.notify_waiters();
    }

    /// Terminate idle environments unused for longer than `max_idle`,
    /// keeping at least `min` tracked. Returns how many were reaped.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let expired = {
            let mut state = self.state.lock().await;
            let mut surplus = state.tracked().saturating_sub(self.config.min);
            let mut keep = Vec::with_capacity(state.idle.len());
            let mut stale = Vec::new();

            // Bottom of the stack has been idle longest
            for slot in std::mem::take(&mut state.idle) {
                let expired = surplus > 0
                    && state.slots[slot]
                        .as_ref()
                        .is_some_and(|record| record.last_used.elapsed() > max_idle);
                if expired {
                    surplus -= 1;
                    stale.push(slot);
                } else {
                    keep.push(slot);
                }
            }
            state.idle = keep;

            stale
                .into_iter()
                .filter_map(|slot| state.vacate(slot))
                .filter_map(|record| record.env)
                .collect::<Vec<_>>()
        };

        let reaped = expired.len();
        if reaped > 0 {
            debug!("Reaping {} idle environments for {}", reaped, self.bundle);
        }
        for env in expired {
            self.terminate(env).await;
        }
        reaped
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            idle: state.idle.len(),
            busy: state.busy.len(),
            closed: state.closed,
        }
    }

    /// Build `count` environments into idle; all or nothing
    async fn fill(&self, state: &mut MutexGuard<'_, PoolState<E>>, count: usize) -> Result<()> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            match self.maker.make().await {
                Ok(env) => created.push(env),
                Err(e) => {
                    warn!(
                        "Creating environment for {} failed after {} of {}: {}",
                        self.bundle,
                        created.len(),
                        count,
                        e
                    );
                    for env in created {
                        self.terminate(env).await;
                    }
                    return Err(e);
                }
            }
        }

        metrics::counter!(ENVIRONMENTS_CREATED, "kind" => "pooled").increment(count as u64);
        for env in created {
            state.insert_idle(env);
        }
        Ok(())
    }

    async fn make_burst(&self) -> Result<E> {
        let env = self.maker.make().await?;
        metrics::counter!(ENVIRONMENTS_CREATED, "kind" => "burst").increment(1);
        debug!("Pool for {} at capacity, burst environment {}", self.bundle, env.id());
        Ok(env)
    }

    async fn terminate(&self, env: E) {
        let id = env.id().to_string();
        if let Err(e) = env.terminate().await {
            warn!("Terminating environment {} for {} failed: {}", id, self.bundle, e);
        }
        metrics::counter!(ENVIRONMENTS_TERMINATED).increment(1);
    }
}
