//! Per-pin photo collections: fetch on miss, evict and refetch on refresh.
//!
//! Each pin moves through `Idle -> Fetching -> Ready`, and `Ready` goes back
//! to `Fetching` on an explicit refresh. At most one fetch cycle runs per pin;
//! a second `ensure` or `refresh` while one is in flight changes nothing.
//!
//! A cycle publishes, in order:
//! - `count-announced(n)` once the result page is known, before any download
//! - `item-saved(i, photo)` for every persisted photo, `i` counting from zero
//! - exactly one terminal event: `collection-ready`, `collection-empty` or
//!   `collection-failed`

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{SyncError, SyncResult};
use crate::geo::{Coordinate, GeoBoundingBoxBuilder};
use crate::materializer::{CancellationFlag, PhotoDownloader, PhotoMaterializer};
use crate::model::{ObjectId, Photo, PhotoId, Pin, PinId};
use crate::notifier::{ChangeNotifier, CollectionEventKind};
use crate::persistence::{ContextKind, PersistenceCoordinator};
use crate::reachability::ReachabilityCheck;
use crate::search::{PhotoSearch, SearchParams};

/// Where a pin's collection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionState {
    #[default]
    Idle,
    /// A cycle is running; `expected` is known once the page arrives
    Fetching { expected: Option<usize> },
    Ready { actual: usize },
}

/// Result of `ensure`
#[derive(Debug)]
pub enum EnsureOutcome {
    /// A new fetch cycle was started
    Started(FetchHandle),
    /// A cycle for this pin is already running
    InFlight,
    /// Photos are already persisted
    Ready { count: usize },
}

/// Result of `refresh`
#[derive(Debug)]
pub enum RefreshOutcome {
    Started(FetchHandle),
    /// Rejected: a cycle for this pin is already running
    InFlight,
}

/// How a fetch cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Ready { expected: usize, actual: usize },
    Empty,
    Failed(SyncError),
    /// The task was aborted before it could finish
    Aborted,
}

/// Handle on a running fetch cycle
#[derive(Debug)]
pub struct FetchHandle {
    pin: PinId,
    join: JoinHandle<CycleOutcome>,
}

impl FetchHandle {
    pub fn pin(&self) -> PinId {
        self.pin
    }

    /// Waits for the cycle to finish
    pub async fn wait(self) -> CycleOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => CycleOutcome::Aborted,
        }
    }
}

/// Tunables for the cache
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub bbox: GeoBoundingBoxBuilder,
    /// Fetch cycles allowed to run at once across all pins
    pub max_concurrent_fetches: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            bbox: GeoBoundingBoxBuilder::default(),
            max_concurrent_fetches: 2,
        }
    }
}

#[derive(Debug, Default)]
struct PinEntry {
    state: CollectionState,
    /// Cycle that owns the `Fetching` state
    cycle: u64,
    cancel: Option<CancellationFlag>,
}

struct CacheInner {
    coordinator: Arc<PersistenceCoordinator>,
    search: Arc<dyn PhotoSearch>,
    reachability: Arc<dyn ReachabilityCheck>,
    materializer: PhotoMaterializer,
    notifier: Arc<ChangeNotifier>,
    bbox: GeoBoundingBoxBuilder,
    permits: Arc<Semaphore>,
    entries: Mutex<HashMap<PinId, PinEntry>>,
    next_cycle: AtomicU64,
}

/// The collection policy layer, keyed by pin identity
#[derive(Clone)]
pub struct PhotoCollectionCache {
    inner: Arc<CacheInner>,
}

impl PhotoCollectionCache {
    pub fn new(
        coordinator: Arc<PersistenceCoordinator>,
        search: Arc<dyn PhotoSearch>,
        downloader: Arc<dyn PhotoDownloader>,
        reachability: Arc<dyn ReachabilityCheck>,
        settings: CacheSettings,
    ) -> Self {
        let notifier = Arc::clone(coordinator.notifier());
        let materializer = PhotoMaterializer::new(downloader, Arc::clone(&coordinator));
        Self {
            inner: Arc::new(CacheInner {
                coordinator,
                search,
                reachability,
                materializer,
                notifier,
                bbox: settings.bbox,
                permits: Arc::new(Semaphore::new(settings.max_concurrent_fetches.max(1))),
                entries: Mutex::new(HashMap::new()),
                next_cycle: AtomicU64::new(1),
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.inner.coordinator
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.inner.notifier
    }

    /// Creates a pin at `coordinate`, reusing one already there
    pub fn drop_pin(&self, coordinate: Coordinate) -> SyncResult<Pin> {
        self.inner.coordinator.create_pin(coordinate)
    }

    pub fn pins(&self) -> Vec<Pin> {
        self.inner.coordinator.all_pins()
    }

    /// Persisted photos for a pin, oldest first
    pub fn photos(&self, pin: &PinId) -> Vec<Photo> {
        self.inner.coordinator.photos_for_pin(pin)
    }

    pub fn state(&self, pin: &PinId) -> CollectionState {
        self.inner
            .lock_entries()
            .get(pin)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Makes sure the pin has a collection, starting a fetch cycle on a miss
    pub fn ensure(&self, pin: &PinId) -> SyncResult<EnsureOutcome> {
        let pin = self.inner.resolve_pin(pin)?;
        let mut entries = self.inner.lock_entries();
        let entry = entries.entry(pin.id).or_default();

        match entry.state {
            CollectionState::Fetching { .. } => {
                debug!("Pin {} already fetching", pin.id);
                Ok(EnsureOutcome::InFlight)
            }
            CollectionState::Ready { actual } => Ok(EnsureOutcome::Ready { count: actual }),
            CollectionState::Idle => {
                let stored = self.inner.coordinator.photos_for_pin(&pin.id).len();
                if stored > 0 {
                    entry.state = CollectionState::Ready { actual: stored };
                    return Ok(EnsureOutcome::Ready { count: stored });
                }
                Ok(EnsureOutcome::Started(self.inner.start_cycle(entry, pin)))
            }
        }
    }

    /// Deletes the pin's photos and fetches a new collection.
    /// Rejected while a cycle for the pin is running.
    pub fn refresh(&self, pin: &PinId) -> SyncResult<RefreshOutcome> {
        let pin = self.inner.resolve_pin(pin)?;
        let mut entries = self.inner.lock_entries();
        let entry = entries.entry(pin.id).or_default();

        if let CollectionState::Fetching { .. } = entry.state {
            info!("Refresh of pin {} rejected: fetch in flight", pin.id);
            return Ok(RefreshOutcome::InFlight);
        }

        let evicted = self.inner.coordinator.transact(ContextKind::Foreground, |ctx| {
            let photos = ctx.photos_for_pin(&pin.id);
            for photo in &photos {
                ctx.delete(ObjectId::Photo(photo.id));
            }
            Ok(photos.len())
        })?;
        info!("Evicted {} photos from pin {}", evicted, pin.id);

        entry.state = CollectionState::Idle;
        Ok(RefreshOutcome::Started(self.inner.start_cycle(entry, pin)))
    }

    /// Deletes one photo. A running cycle for the pin stops after its
    /// current item.
    pub fn delete(&self, pin: &PinId, photo: &PhotoId) -> SyncResult<()> {
        self.inner.coordinator.transact(ContextKind::Foreground, |ctx| {
            let found = ctx.photo(photo)?;
            if found.pin != *pin {
                return Err(SyncError::NotFound(format!("photo {photo} on pin {pin}")));
            }
            ctx.delete(ObjectId::Photo(found.id));
            Ok(())
        })?;

        let mut entries = self.inner.lock_entries();
        if let Some(entry) = entries.get_mut(pin) {
            match entry.state {
                CollectionState::Fetching { .. } => {
                    if let Some(cancel) = &entry.cancel {
                        cancel.cancel();
                    }
                }
                CollectionState::Ready { actual } => {
                    entry.state = CollectionState::Ready {
                        actual: actual.saturating_sub(1),
                    };
                }
                CollectionState::Idle => {}
            }
        }
        Ok(())
    }

    /// Deletes a pin and its photos, stopping and evicting any running cycle
    pub fn delete_pin(&self, pin: &PinId) -> SyncResult<()> {
        if let Some(entry) = self.inner.lock_entries().remove(pin) {
            if let Some(cancel) = entry.cancel {
                cancel.cancel();
            }
        }

        self.inner.coordinator.transact(ContextKind::Foreground, |ctx| {
            ctx.pin(pin)?;
            ctx.delete(ObjectId::Pin(*pin));
            Ok(())
        })?;
        info!("Deleted pin {pin}");
        Ok(())
    }
}

impl CacheInner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<PinId, PinEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve_pin(&self, pin: &PinId) -> SyncResult<Pin> {
        self.coordinator
            .perform(ContextKind::Foreground, |ctx| ctx.pin(pin))
    }

    /// Moves `entry` to `Fetching` and spawns the cycle. Caller holds the entries lock.
    fn start_cycle(self: &Arc<Self>, entry: &mut PinEntry, pin: Pin) -> FetchHandle {
        let cycle = self.next_cycle.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationFlag::new();
        entry.state = CollectionState::Fetching { expected: None };
        entry.cycle = cycle;
        entry.cancel = Some(cancel.clone());

        info!("Starting fetch cycle {} for pin {} at {}", cycle, pin.id, pin.coordinate);
        let pin_id = pin.id;
        let inner = Arc::clone(self);
        let join = tokio::spawn(async move { inner.run_cycle(pin, cycle, cancel).await });
        FetchHandle { pin: pin_id, join }
    }

    async fn run_cycle(self: Arc<Self>, pin: Pin, cycle: u64, cancel: CancellationFlag) -> CycleOutcome {
        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok();

        let reachability = Arc::clone(&self.reachability);
        let target = self.search.target().to_string();
        let reachable = tokio::task::spawn_blocking(move || reachability.is_reachable(&target))
            .await
            .unwrap_or(false);
        if !reachable {
            return self.fail(pin.id, cycle, SyncError::NetworkUnavailable);
        }

        let params = SearchParams {
            bbox: self.bbox.build_for(&pin.coordinate),
        };
        let page = match self.search.search(&params).await {
            Ok(page) => page,
            Err(SyncError::EmptyResult) => return self.finish_empty(pin.id, cycle),
            Err(e) => return self.fail(pin.id, cycle, e),
        };

        let expected = page.photos.len();
        if cancel.is_cancelled() || !self.announce(pin.id, cycle, expected) {
            return self.finish_cancelled(pin.id, cycle, expected);
        }

        let notifier = Arc::clone(&self.notifier);
        let pin_id = pin.id;
        let result = self
            .materializer
            .materialize(pin.id, page.photos, &cancel, move |index, photo| {
                notifier.post_collection(pin_id, CollectionEventKind::ItemSaved { index, photo });
            })
            .await;

        match result {
            Ok(report) if report.cancelled => self.finish_cancelled(pin.id, cycle, expected),
            Ok(report) => self.finish_ready(pin.id, cycle, expected, report.saved.len()),
            Err((e, partial)) => {
                self.discard_photos(partial.saved).await;
                self.fail(pin.id, cycle, e)
            }
        }
    }

    /// Applies `state` if `cycle` still owns the entry (`None` evicts it),
    /// then publishes the terminal event before the entry can be reused
    fn settle(&self, pin: PinId, cycle: u64, state: Option<CollectionState>, terminal: CollectionEventKind) {
        let mut entries = self.lock_entries();
        let owned = entries
            .get(&pin)
            .is_some_and(|entry| entry.cycle == cycle);
        if owned {
            match state {
                Some(state) => {
                    if let Some(entry) = entries.get_mut(&pin) {
                        entry.state = state;
                        entry.cancel = None;
                    }
                }
                None => {
                    entries.remove(&pin);
                }
            }
        }
        self.notifier.post_collection(pin, terminal);
    }

    /// Records the expected count and publishes it. False if the cycle lost its entry.
    fn announce(&self, pin: PinId, cycle: u64, expected: usize) -> bool {
        {
            let mut entries = self.lock_entries();
            match entries.get_mut(&pin) {
                Some(entry) if entry.cycle == cycle => {
                    entry.state = CollectionState::Fetching {
                        expected: Some(expected),
                    };
                }
                _ => return false,
            }
        }
        self.notifier
            .post_collection(pin, CollectionEventKind::CountAnnounced { expected });
        true
    }

    fn finish_ready(&self, pin: PinId, cycle: u64, expected: usize, actual: usize) -> CycleOutcome {
        info!("Pin {pin}: {actual} of {expected} photos saved");
        self.settle(
            pin,
            cycle,
            Some(CollectionState::Ready { actual }),
            CollectionEventKind::CollectionReady { actual },
        );
        CycleOutcome::Ready { expected, actual }
    }

    fn finish_empty(&self, pin: PinId, cycle: u64) -> CycleOutcome {
        info!("Pin {pin}: search returned no photos");
        self.settle(
            pin,
            cycle,
            Some(CollectionState::Ready { actual: 0 }),
            CollectionEventKind::CollectionEmpty,
        );
        CycleOutcome::Empty
    }

    /// Ends a stopped cycle: ready with what is stored, or failed if the pin is gone
    fn finish_cancelled(&self, pin: PinId, cycle: u64, expected: usize) -> CycleOutcome {
        match self.resolve_pin(&pin) {
            Ok(_) => {
                let actual = self.coordinator.photos_for_pin(&pin).len();
                self.finish_ready(pin, cycle, expected, actual)
            }
            Err(e) => {
                self.settle(
                    pin,
                    cycle,
                    None,
                    CollectionEventKind::CollectionFailed { reason: e.clone() },
                );
                CycleOutcome::Failed(e)
            }
        }
    }

    fn fail(&self, pin: PinId, cycle: u64, reason: SyncError) -> CycleOutcome {
        if reason.is_retryable() {
            warn!("Fetch for pin {pin} failed, will retry on next request: {reason}");
        } else {
            error!("Fetch for pin {pin} failed: {reason}");
        }
        self.settle(
            pin,
            cycle,
            Some(CollectionState::Idle),
            CollectionEventKind::CollectionFailed {
                reason: reason.clone(),
            },
        );
        CycleOutcome::Failed(reason)
    }

    /// Removes photos saved by an aborted cycle so a retry starts clean
    async fn discard_photos(&self, photos: Vec<PhotoId>) {
        if photos.is_empty() {
            return;
        }
        let count = photos.len();
        let coordinator = Arc::clone(&self.coordinator);
        let removed = tokio::task::spawn_blocking(move || {
            coordinator.transact(ContextKind::Background, |ctx| {
                for photo in &photos {
                    ctx.delete(ObjectId::Photo(*photo));
                }
                Ok(())
            })
        })
        .await;
        match removed {
            Ok(Ok(())) => debug!("Removed {count} partial photos"),
            Ok(Err(e)) => warn!("Could not remove {count} partial photos: {e}"),
            Err(e) => warn!("Could not remove {count} partial photos: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDownloader, MockSearch};
    use crate::notifier::ChangeNotifier;
    use crate::reachability::StaticReachability;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    fn cache_with(search: MockSearch, downloader: MockDownloader, reachable: bool) -> PhotoCollectionCache {
        let notifier = ChangeNotifier::spawn();
        let coordinator =
            Arc::new(PersistenceCoordinator::open(Box::new(MemoryBackend), notifier).unwrap());
        PhotoCollectionCache::new(
            coordinator,
            Arc::new(search),
            Arc::new(downloader),
            Arc::new(StaticReachability(reachable)),
            CacheSettings::default(),
        )
    }

    fn images(urls: &[&str]) -> MockDownloader {
        urls.iter()
            .enumerate()
            .fold(MockDownloader::new(), |d, (i, url)| d.with_image(url, vec![i as u8 + 1]))
    }

    #[tokio::test]
    async fn test_ensure_fetches_then_serves_stored() {
        let urls = ["https://img.test/1.jpg", "https://img.test/2.jpg"];
        let cache = cache_with(MockSearch::with_urls(&urls), images(&urls), true);
        let pin = cache.drop_pin(Coordinate::new(48.85, 2.29)).unwrap();

        let EnsureOutcome::Started(handle) = cache.ensure(&pin.id).unwrap() else {
            panic!("expected a new fetch cycle");
        };
        assert_eq!(
            handle.wait().await,
            CycleOutcome::Ready {
                expected: 2,
                actual: 2
            }
        );
        assert_eq!(cache.state(&pin.id), CollectionState::Ready { actual: 2 });

        assert!(matches!(
            cache.ensure(&pin.id).unwrap(),
            EnsureOutcome::Ready { count: 2 }
        ));
    }

    #[tokio::test]
    async fn test_second_ensure_while_fetching_is_coalesced() {
        let urls = ["https://img.test/1.jpg"];
        let search = Arc::new(MockSearch::with_urls(&urls));
        let notifier = ChangeNotifier::spawn();
        let coordinator =
            Arc::new(PersistenceCoordinator::open(Box::new(MemoryBackend), notifier).unwrap());
        let cache = PhotoCollectionCache::new(
            coordinator,
            Arc::clone(&search) as Arc<dyn PhotoSearch>,
            Arc::new(images(&urls).with_delay(Duration::from_millis(50))),
            Arc::new(StaticReachability(true)),
            CacheSettings::default(),
        );
        let pin = cache.drop_pin(Coordinate::new(1.0, 1.0)).unwrap();

        // Start one cycle, then ask again while it runs
        let first = cache.ensure(&pin.id).unwrap();
        let second = cache.ensure(&pin.id).unwrap();
        assert!(matches!(second, EnsureOutcome::InFlight));
        assert!(matches!(
            cache.refresh(&pin.id).unwrap(),
            RefreshOutcome::InFlight
        ));

        let EnsureOutcome::Started(handle) = first else {
            panic!("expected a new fetch cycle");
        };
        handle.wait().await;
        assert_eq!(search.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_network_fails_and_resets() {
        let cache = cache_with(MockSearch::with_urls(&[]), MockDownloader::new(), false);
        let pin = cache.drop_pin(Coordinate::new(2.0, 2.0)).unwrap();

        let EnsureOutcome::Started(handle) = cache.ensure(&pin.id).unwrap() else {
            panic!("expected a new fetch cycle");
        };
        assert_eq!(
            handle.wait().await,
            CycleOutcome::Failed(SyncError::NetworkUnavailable)
        );
        assert_eq!(cache.state(&pin.id), CollectionState::Idle);
    }

    #[tokio::test]
    async fn test_refresh_replaces_collection() {
        let urls = ["https://img.test/1.jpg", "https://img.test/2.jpg", "https://img.test/3.jpg"];
        let cache = cache_with(MockSearch::with_urls(&urls), images(&urls), true);
        let pin = cache.drop_pin(Coordinate::new(3.0, 3.0)).unwrap();

        let EnsureOutcome::Started(handle) = cache.ensure(&pin.id).unwrap() else {
            panic!("expected a new fetch cycle");
        };
        handle.wait().await;
        let before: Vec<PhotoId> = cache.photos(&pin.id).iter().map(|p| p.id).collect();

        // Refresh replaces every photo
        let RefreshOutcome::Started(handle) = cache.refresh(&pin.id).unwrap() else {
            panic!("expected refresh to start");
        };
        handle.wait().await;

        let after: Vec<PhotoId> = cache.photos(&pin.id).iter().map(|p| p.id).collect();
        assert_eq!(after.len(), 3);
        assert!(after.iter().all(|id| !before.contains(id)));
    }

    #[tokio::test]
    async fn test_delete_photo_updates_ready_count() {
        let urls = ["https://img.test/1.jpg", "https://img.test/2.jpg"];
        let cache = cache_with(MockSearch::with_urls(&urls), images(&urls), true);
        let pin = cache.drop_pin(Coordinate::new(4.0, 4.0)).unwrap();

        let EnsureOutcome::Started(handle) = cache.ensure(&pin.id).unwrap() else {
            panic!("expected a new fetch cycle");
        };
        handle.wait().await;

        // Delete one photo from the ready collection
        let photo = cache.photos(&pin.id)[0].id;
        cache.delete(&pin.id, &photo).unwrap();
        assert_eq!(cache.photos(&pin.id).len(), 1);
        assert_eq!(cache.state(&pin.id), CollectionState::Ready { actual: 1 });

        // deleting it again, or through another pin, is NotFound
        assert!(matches!(
            cache.delete(&pin.id, &photo),
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_unknown_pin_is_not_found() {
        let cache = cache_with(MockSearch::with_urls(&[]), MockDownloader::new(), true);
        assert!(matches!(
            cache.ensure(&PinId::new()),
            Err(SyncError::NotFound(_))
        ));
    }
}
