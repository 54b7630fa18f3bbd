use crate::{BoxError, Error, Result};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn, Instrument};

/// Builds a cluster client that acts with an identity's credentials.
pub trait MakeClient<C>: Send + Sync {
    fn make_client(&self, token: &str) -> Result<C, BoxError>;
}

/// The shortest period between two sweeps.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Caches one cluster client per identity token.
///
/// A client is built lazily on the first lookup of its token and reused until
/// a sweep finds it older than the maximum age; it is never refreshed in
/// between. Evicting a client drops the cache's handle to it, so callers
/// that still hold a clone keep using it until they let it go.
pub struct ClientCache<C> {
    entries: RwLock<HashMap<String, Entry<C>>>,
    make_client: Box<dyn MakeClient<C>>,
    max_age: Duration,
    metrics: ClientCacheMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ClientCacheMetrics {
    hits: Counter,
    misses: Counter,
    evictions: Counter,
    entries: Gauge,
}

/// A running eviction sweep.
///
/// Dropping the handle stops the sweep; [`Sweep::shutdown`] additionally
/// waits for it to release every cached client.
#[must_use]
pub struct Sweep {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Entry<C> {
    client: C,
    created_at: Instant,
}

// === impl MakeClient ===

impl<C, F> MakeClient<C> for F
where
    F: Fn(&str) -> Result<C, BoxError> + Send + Sync,
{
    fn make_client(&self, token: &str) -> Result<C, BoxError> {
        (self)(token)
    }
}

// === impl ClientCache ===

impl<C: Clone> ClientCache<C> {
    pub fn new(make_client: impl MakeClient<C> + 'static, max_age: Duration) -> Self {
        Self {
            entries: Default::default(),
            make_client: Box::new(make_client),
            max_age,
            metrics: Default::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: ClientCacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the token's client, building and caching one if the token has
    /// none.
    ///
    /// Factory failures are returned as [`Error::Client`] and leave nothing
    /// cached.
    pub fn get(&self, token: &str) -> Result<C> {
        if let Some(entry) = self.entries.read().get(token) {
            self.metrics.hits.inc();
            return Ok(entry.client.clone());
        }

        self.metrics.misses.inc();
        let client = self.make_client.make_client(token).map_err(Error::Client)?;

        let mut entries = self.entries.write();
        // Another caller may have cached a client for this token while ours
        // was being built. The first one stays and ours is dropped.
        let entry = entries
            .entry(token.to_string())
            .or_insert_with(|| Entry {
                client,
                created_at: Instant::now(),
            });
        let client = entry.client.clone();
        self.metrics.entries.set(entries.len() as i64);
        Ok(client)
    }

    /// Drops the token's client, if one is cached.
    pub fn invalidate(&self, token: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let removed = entries.remove(token);
            self.metrics.entries.set(entries.len() as i64);
            removed
        };
        removed.is_some()
    }

    /// Drops every client older than the maximum age and returns how many
    /// were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut entries = self.entries.write();
            let tokens = entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.created_at) > self.max_age)
                .map(|(token, _)| token.clone())
                .collect::<Vec<_>>();
            let expired = tokens
                .iter()
                .filter_map(|token| entries.remove(token))
                .collect::<Vec<_>>();
            self.metrics.entries.set(entries.len() as i64);
            expired
        };

        // Clients are released outside of the lock.
        let evicted = expired.len();
        drop(expired);
        if evicted > 0 {
            self.metrics.evictions.inc_by(evicted as u64);
            debug!(evicted, "Evicted expired clients");
        }
        evicted
    }

    /// Drops every cached client.
    pub fn clear(&self) -> usize {
        let drained = {
            let mut entries = self.entries.write();
            self.metrics.entries.set(0);
            entries.drain().map(|(_, e)| e).collect::<Vec<_>>()
        };
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

impl<C> ClientCache<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Spawns a task that evicts expired clients every `interval`.
    ///
    /// The sweep never holds the cache's lock across an await point, so it
    /// does not stall lookups. Intervals shorter than [`MIN_SWEEP_INTERVAL`]
    /// are raised to it.
    pub fn spawn_sweep(self: &Arc<Self>, interval: Duration) -> Sweep {
        if interval < MIN_SWEEP_INTERVAL {
            warn!(?interval, min = ?MIN_SWEEP_INTERVAL, "Sweep interval too short");
        }
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let (stop, mut stopped) = oneshot::channel::<()>();
        let cache = self.clone();
        let task = tokio::spawn(
            async move {
                info!(?interval, max_age = ?cache.max_age, "Sweeping client cache");
                let mut ticks = time::interval(interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticks.tick() => {
                            cache.evict_expired();
                        }
                        _ = &mut stopped => break,
                    }
                }
                let released = cache.clear();
                info!(released, "Client cache shut down");
            }
            .instrument(info_span!("client_cache")),
        );
        Sweep { stop, task }
    }
}

// === impl ClientCacheMetrics ===

impl ClientCacheMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "hits",
            "Lookups served by a cached client",
            metrics.hits.clone(),
        );
        reg.register(
            "misses",
            "Lookups that built a new client",
            metrics.misses.clone(),
        );
        reg.register(
            "evictions",
            "Clients dropped for exceeding the maximum age",
            metrics.evictions.clone(),
        );
        reg.register(
            "entries",
            "Clients currently cached",
            metrics.entries.clone(),
        );
        metrics
    }
}

// === impl Sweep ===

impl Sweep {
    /// Stops the sweep and waits until every cached client is released.
    pub async fn shutdown(self) {
        let Self { stop, task } = self;
        let _ = stop.send(());
        if let Err(error) = task.await {
            tracing::warn!(%error, "Client cache sweep failed");
        }
    }
}
