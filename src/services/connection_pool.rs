use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::middleware::AppError;
use crate::services::database::{Engine, EngineFactory};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// One pooled engine. The cell is filled at most once; creation runs outside
/// the map lock so a slow connect never stalls other connection ids.
struct Slot {
    engine: OnceCell<Arc<dyn Engine>>,
    last_used: Mutex<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self {
            engine: OnceCell::new(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_used
            .lock()
            .map(|last_used| now.saturating_duration_since(*last_used))
            .unwrap_or_default()
    }
}

struct PoolInner {
    factory: Arc<dyn EngineFactory>,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl PoolInner {
    /// Evict and dispose every engine idle longer than the threshold.
    async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<(String, Arc<Slot>)> = {
            let mut slots = self.slots.write().await;
            let expired: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| slot.idle_for(now) > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| slots.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let count = evicted.len();
        dispose_slots(evicted).await;
        count
    }
}

struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Engine pool keyed by connection id, with idle eviction driven by a
/// background sweep the pool owns. The sweep starts on first use and is
/// stopped and awaited by [`EnginePool::close`].
pub struct EnginePool {
    inner: Arc<PoolInner>,
    sweep_interval: Duration,
    sweeper_started: AtomicBool,
    sweeper: tokio::sync::Mutex<Option<Sweeper>>,
}

impl EnginePool {
    /// Create a pool with default idle timeout and sweep interval
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self::with_config(factory, DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_config(
        factory: Arc<dyn EngineFactory>,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                slots: RwLock::new(HashMap::new()),
                idle_timeout,
                closed: AtomicBool::new(false),
            }),
            sweep_interval,
            sweeper_started: AtomicBool::new(false),
            sweeper: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the engine for `connection_id`, creating it from `driver_url` on
    /// first use. Safe to call concurrently from multiple tasks.
    pub async fn get(
        &self,
        connection_id: &str,
        driver_url: &str,
    ) -> Result<Arc<dyn Engine>, AppError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AppError::Internal("Engine pool is closed".to_string()));
        }
        self.ensure_sweeper().await;

        // Fast path: slot already exists (read lock)
        let existing = {
            let slots = self.inner.slots.read().await;
            slots.get(connection_id).cloned()
        };
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut slots = self.inner.slots.write().await;
                slots
                    .entry(connection_id.to_string())
                    .or_insert_with(|| Arc::new(Slot::new()))
                    .clone()
            }
        };

        let created = slot
            .engine
            .get_or_try_init(|| async {
                tracing::info!("Creating engine for connection {}", connection_id);
                self.inner.factory.connect(driver_url).await
            })
            .await;

        match created {
            Ok(engine) => {
                slot.touch();
                Ok(engine.clone())
            }
            Err(e) => {
                tracing::warn!("Failed to create engine for connection {}: {}", connection_id, e);
                let mut slots = self.inner.slots.write().await;
                let stale = slots
                    .get(connection_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.engine.get().is_none());
                if stale {
                    slots.remove(connection_id);
                }
                Err(e)
            }
        }
    }

    /// Dispose the engine for one connection. Returns whether one existed.
    pub async fn dispose(&self, connection_id: &str) -> bool {
        let removed = {
            let mut slots = self.inner.slots.write().await;
            slots.remove(connection_id)
        };

        match removed {
            Some(slot) => {
                tracing::info!("Disposing engine for connection {}", connection_id);
                dispose_slots(vec![(connection_id.to_string(), slot)]).await;
                true
            }
            None => false,
        }
    }

    /// Dispose every pooled engine.
    pub async fn dispose_all(&self) -> usize {
        let drained: Vec<(String, Arc<Slot>)> = {
            let mut slots = self.inner.slots.write().await;
            slots.drain().collect()
        };
        let count = drained.len();
        dispose_slots(drained).await;
        count
    }

    /// Run one eviction pass now.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Stop the sweep, wait for it to finish, then dispose everything.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let sweeper = self.sweeper.lock().await.take();
        if let Some(Sweeper { shutdown, handle }) = sweeper {
            let _ = shutdown.send(());
            if let Err(e) = handle.await {
                tracing::error!("Engine sweep task failed: {}", e);
            }
        }

        let disposed = self.dispose_all().await;
        tracing::info!("Engine pool closed ({} engines disposed)", disposed);
    }

    pub async fn len(&self) -> usize {
        self.inner.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.inner.slots.read().await.contains_key(connection_id)
    }

    pub async fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .await
            .as_ref()
            .is_some_and(|sweeper| !sweeper.handle.is_finished())
    }

    async fn ensure_sweeper(&self) {
        if self.sweeper_started.load(Ordering::Acquire) {
            return;
        }
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let evicted = inner.sweep_idle().await;
                        if evicted > 0 {
                            tracing::info!("Idle sweep disposed {} engines", evicted);
                        }
                    }
                }
            }
            tracing::debug!("Engine sweep stopped");
        });

        tracing::debug!("Engine sweep started (interval {:?})", interval);
        *sweeper = Some(Sweeper { shutdown, handle });
        self.sweeper_started.store(true, Ordering::Release);
    }
}

async fn dispose_slots(slots: Vec<(String, Arc<Slot>)>) {
    let closes = slots.into_iter().filter_map(|(id, slot)| {
        slot.engine.get().cloned().map(|engine| async move {
            engine.close().await;
            tracing::debug!("Engine for connection {} closed", id);
        })
    });
    join_all(closes).await;
}
