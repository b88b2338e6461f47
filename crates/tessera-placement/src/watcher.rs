//! Staged placement watcher
//!
//! Follows one key of the backing store. Every new value is decoded into a
//! [`StagedPlacement`] whose active part replaces the previous one under the
//! watcher's write lock; the previous active placement is closed.

use crate::staged::{ActiveStagedPlacement, ActiveStagedPlacementOptions, StagedPlacement};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{Error, Result, WatcherConfig};
use tessera_kv::{KvError, Store, Value, ValueWatch};
use tessera_proto as proto;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Watcher settings
#[derive(Clone, Debug)]
pub struct StagedPlacementWatcherOptions {
    pub key: String,
    /// How long the first watch waits for a value before reading the key
    /// directly
    pub init_watch_timeout: Duration,
    pub active_opts: ActiveStagedPlacementOptions,
}

impl StagedPlacementWatcherOptions {
    #[must_use]
    pub fn new(key: impl Into<String>, config: &WatcherConfig) -> Self {
        Self {
            key: key.into(),
            init_watch_timeout: config.init_watch_timeout(),
            active_opts: ActiveStagedPlacementOptions::default(),
        }
    }

    #[must_use]
    pub fn with_active_opts(mut self, opts: ActiveStagedPlacementOptions) -> Self {
        self.active_opts = opts;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    NotWatching,
    Watching,
    /// The store side of the watch went away
    Closed,
}

#[derive(Debug)]
struct WatcherState {
    status: Status,
    version: u64,
    placement: Option<ActiveStagedPlacement>,
}

impl WatcherState {
    fn close_placement(&mut self) {
        if let Some(old) = self.placement.take()
            && let Err(e) = old.close()
        {
            warn!("Failed to close active staged placement: {}", e);
        }
    }
}

/// Keeps the active staged placement of one key up to date
#[derive(Debug)]
pub struct StagedPlacementWatcher<S: Store> {
    store: S,
    opts: StagedPlacementWatcherOptions,
    state: Arc<RwLock<WatcherState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Store> StagedPlacementWatcher<S> {
    pub fn new(store: S, opts: StagedPlacementWatcherOptions) -> Self {
        Self {
            store,
            opts,
            state: Arc::new(RwLock::new(WatcherState {
                status: Status::NotWatching,
                version: 0,
                placement: None,
            })),
            task: Mutex::new(None),
        }
    }

    /// Start following the key. Waits up to the initial watch timeout for a
    /// first value and falls back to reading the key directly.
    pub async fn watch(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.status == Status::Watching {
                return Err(Error::AlreadyWatching);
            }
            state.status = Status::Watching;
        }

        let mut values = match self.store.watch(&self.opts.key) {
            Ok(values) => values,
            Err(e) => {
                self.state.write().status = Status::NotWatching;
                return Err(e.into());
            }
        };

        let initial =
            match tokio::time::timeout(self.opts.init_watch_timeout, values.changed()).await {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => {
                    self.state.write().status = Status::NotWatching;
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(
                        "Timed out after {:?} waiting for the initial value of {}, reading it directly",
                        self.opts.init_watch_timeout, self.opts.key
                    );
                    match self.store.get(&self.opts.key) {
                        Ok(value) => Some(value),
                        Err(KvError::NotFound(_)) => None,
                        Err(e) => {
                            self.state.write().status = Status::NotWatching;
                            return Err(e.into());
                        }
                    }
                }
            };
        if let Some(value) = initial {
            process(&self.state, &value, &self.opts.active_opts);
        }

        let handle = tokio::spawn(run(
            values,
            Arc::clone(&self.state),
            self.opts.active_opts.clone(),
        ));
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!("Watching staged placement {}", self.opts.key);
        Ok(())
    }

    /// Stop following the key and close the active placement
    pub fn unwatch(&self) -> Result<()> {
        let mut state = self.state.write();
        match state.status {
            Status::NotWatching => return Err(Error::NotWatching),
            Status::Closed | Status::Watching => {}
        }
        state.status = Status::NotWatching;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        state.close_placement();
        info!("Stopped watching staged placement {}", self.opts.key);
        Ok(())
    }

    /// Store version of the staged placement in effect
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// The active staged placement. The returned guard holds the watcher's
    /// read lock, so updates wait until it is dropped.
    pub fn active_staged_placement(&self) -> Result<MappedRwLockReadGuard<'_, ActiveStagedPlacement>> {
        let state = self.state.read();
        match state.status {
            Status::NotWatching => return Err(Error::NotWatching),
            Status::Closed => return Err(Error::WatcherClosed),
            Status::Watching => {}
        }
        RwLockReadGuard::try_map(state, |s| s.placement.as_ref())
            .map_err(|_| Error::NoApplicablePlacement)
    }
}

impl<S: Store> Drop for StagedPlacementWatcher<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run(
    mut values: ValueWatch,
    state: Arc<RwLock<WatcherState>>,
    opts: ActiveStagedPlacementOptions,
) {
    loop {
        match values.changed().await {
            Ok(Some(value)) => process(&state, &value, &opts),
            Ok(None) => {
                info!("Staged placement {} was deleted", values.key());
                let mut state = state.write();
                state.close_placement();
                state.version = 0;
            }
            Err(e) => {
                warn!("Stopped watching staged placement: {}", e);
                let mut state = state.write();
                state.status = Status::Closed;
                state.close_placement();
                return;
            }
        }
    }
}

/// Swap in the staged placement decoded from `value`. A value that cannot
/// be decoded closes the current placement and leaves the watch running.
fn process(state: &RwLock<WatcherState>, value: &Value, opts: &ActiveStagedPlacementOptions) {
    let decoded = value
        .decode::<proto::PlacementSnapshots>()
        .map_err(Error::from)
        .and_then(|snapshots| StagedPlacement::from_proto(value.version(), &snapshots, opts.clone()));

    let mut state = state.write();
    if state.status != Status::Watching {
        return;
    }
    state.close_placement();
    match decoded {
        Ok(staged) => {
            let now = (opts.now_fn)();
            state.placement = Some(staged.active_staged_placement(now));
            state.version = staged.version();
            info!(
                "Updated staged placement to version {} with {} placements",
                staged.version(),
                staged.placements().len()
            );
        }
        Err(e) => {
            error!(
                "Failed to decode staged placement at version {}: {}",
                value.version(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::options::Options;
    use crate::placement::Placement;
    use crate::shard::{Shard, ShardState, Shards};
    use crate::storage::KvPlacementStorage;
    use bytes::Bytes;
    use tessera_kv::MemStore;

    const KEY: &str = "_sd.placement/svc";

    fn placement(cutover: i64) -> Placement {
        let shards: Shards = [0, 1]
            .into_iter()
            .map(|id| Shard::new(id).with_state(ShardState::Available))
            .collect();
        Placement::new()
            .with_instances([Instance::new_empty("i1", "r1", "z1", "i1:1", 1).with_shards(shards)])
            .with_shards(vec![0, 1])
            .with_replica_factor(1)
            .with_is_sharded(true)
            .with_cutover_nanos(cutover)
    }

    fn storage(store: &Arc<MemStore>) -> KvPlacementStorage<Arc<MemStore>> {
        KvPlacementStorage::new(Arc::clone(store), KEY, Options::default().with_is_staged(true))
    }

    fn watcher(store: &Arc<MemStore>) -> StagedPlacementWatcher<Arc<MemStore>> {
        let config = WatcherConfig {
            init_watch_timeout_ms: 20,
        };
        let opts = StagedPlacementWatcherOptions::new(KEY, &config)
            .with_active_opts(ActiveStagedPlacementOptions::default().with_now_fn(|| 1_000));
        StagedPlacementWatcher::new(Arc::clone(store), opts)
    }

    async fn wait_for_version(w: &StagedPlacementWatcher<Arc<MemStore>>, version: u64) {
        for _ in 0..200 {
            if w.version() == version {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watcher never reached version {version}");
    }

    fn active_cutover(w: &StagedPlacementWatcher<Arc<MemStore>>) -> Result<i64> {
        let active = w.active_staged_placement()?;
        let p = active.active_placement()?;
        Ok(p.cutover_nanos)
    }

    #[tokio::test]
    async fn test_watch_existing_value() {
        let store = Arc::new(MemStore::new());
        storage(&store).set(&placement(100)).unwrap();

        let w = watcher(&store);
        assert!(matches!(w.active_staged_placement(), Err(Error::NotWatching)));
        w.watch().await.unwrap();
        assert_eq!(w.version(), 1);
        assert_eq!(active_cutover(&w).unwrap(), 100);
        assert!(matches!(w.watch().await, Err(Error::AlreadyWatching)));

        w.unwatch().unwrap();
        assert!(matches!(w.active_staged_placement(), Err(Error::NotWatching)));
        assert!(matches!(w.unwatch(), Err(Error::NotWatching)));
    }

    #[tokio::test]
    async fn test_updates_replace_active_placement() {
        let store = Arc::new(MemStore::new());
        let s = storage(&store);
        s.set(&placement(100)).unwrap();

        let w = watcher(&store);
        w.watch().await.unwrap();

        s.set(&placement(500)).unwrap();
        wait_for_version(&w, 2).await;
        assert_eq!(active_cutover(&w).unwrap(), 500);

        s.set(&placement(2_000)).unwrap();
        wait_for_version(&w, 3).await;
        // Clock at 1000 so the newest placement is still upcoming
        assert_eq!(active_cutover(&w).unwrap(), 500);
    }

    #[tokio::test]
    async fn test_initial_timeout_falls_back_to_get() {
        let store = Arc::new(MemStore::new());
        let w = watcher(&store);
        w.watch().await.unwrap();
        assert!(matches!(
            w.active_staged_placement(),
            Err(Error::NoApplicablePlacement)
        ));

        storage(&store).set(&placement(100)).unwrap();
        wait_for_version(&w, 1).await;
        assert_eq!(active_cutover(&w).unwrap(), 100);
    }

    #[tokio::test]
    async fn test_bad_value_closes_active_placement() {
        let store = Arc::new(MemStore::new());
        storage(&store).set(&placement(100)).unwrap();
        let w = watcher(&store);
        w.watch().await.unwrap();

        store.set(KEY, Bytes::from_static(&[0xff])).unwrap();
        for _ in 0..200 {
            if w.active_staged_placement().is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(
            w.active_staged_placement(),
            Err(Error::NoApplicablePlacement)
        ));

        // A later good value recovers
        store.delete(KEY).unwrap();
        storage(&store).set(&placement(200)).unwrap();
        wait_for_version(&w, 1).await;
        for _ in 0..200 {
            if active_cutover(&w).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(active_cutover(&w).unwrap(), 200);
    }
}
