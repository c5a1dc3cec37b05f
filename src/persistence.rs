//! Two cooperating persistence contexts over one store.
//!
//! The foreground context serves the interactive side: lookups, pin creation,
//! user-driven deletions. The background context is written by the fetch
//! cycles' save loops. Both write through to the same `Snapshot`.
//!
//! Rules:
//! - a context only mutates objects it fetched or re-resolved itself; objects
//!   are plain values, so a handle from the other context is always re-read
//!   by id (`Context::pin`, `Context::photo`) before use
//! - `transact` commits exactly the changes its closure made, so concurrent
//!   writers sharing a context never commit or discard each other's work
//! - a failed commit leaves the store untouched and is reported as
//!   `PersistenceFailure`
//! - after every successful commit both contexts merge the change and a
//!   `did-save` event is published
//!
//! Commits are serialized on their own lock. The store's write lock is only
//! held to swap in the new snapshot, never across backend I/O, so foreground
//! reads do not wait on a background disk write.
//!
//! Lock order is commit, then context, then store. Neither `save` nor
//! `transact` may be called from inside `perform` or `transact`.

use log::{debug, error};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use chrono::Utc;

use crate::error::{SyncError, SyncResult};
use crate::geo::Coordinate;
use crate::model::{Entity, FetchRequest, ObjectId, Photo, PhotoId, Pin, PinId};
use crate::notifier::{ChangeNotifier, Event, SaveNotification};
use crate::store::{AppliedChanges, ChangeSet, Snapshot, StoreBackend};

/// Which of the two contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContextKind {
    #[default]
    Foreground,
    Background,
}

impl ContextKind {
    pub fn other(self) -> Self {
        match self {
            ContextKind::Foreground => ContextKind::Background,
            ContextKind::Background => ContextKind::Foreground,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKind::Foreground => write!(f, "foreground"),
            ContextKind::Background => write!(f, "background"),
        }
    }
}

/// Pending work of one context
#[derive(Debug, Default)]
struct ContextState {
    /// Pending inserts, in insertion order
    inserted: Vec<Entity>,
    /// Pending deletes
    deleted: HashSet<ObjectId>,
}

impl ContextState {
    fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.deleted.is_empty()
    }

    fn take_changes(&mut self) -> ChangeSet {
        let mut deleted: Vec<ObjectId> = self.deleted.drain().collect();
        deleted.sort();
        ChangeSet {
            inserted: std::mem::take(&mut self.inserted),
            deleted,
        }
    }

    /// Puts back changes set aside by `take_changes`
    fn restore(&mut self, changes: ChangeSet) {
        let mut inserted = changes.inserted;
        inserted.append(&mut self.inserted);
        self.inserted = inserted;
        self.deleted.extend(changes.deleted);
    }

    /// Folds a commit made elsewhere into this context's pending work
    fn merge(&mut self, applied: &AppliedChanges) {
        for id in &applied.deleted {
            self.deleted.remove(id);
        }
        // pending photos whose pin disappeared can never be saved
        let deleted_pins: HashSet<PinId> = applied
            .deleted
            .iter()
            .filter_map(|id| match id {
                ObjectId::Pin(pin) => Some(*pin),
                ObjectId::Photo(_) => None,
            })
            .collect();
        self.inserted.retain(|entity| match entity {
            Entity::Photo(photo) => !deleted_pins.contains(&photo.pin),
            Entity::Pin(pin) => !deleted_pins.contains(&pin.id),
        });
    }
}

/// A context borrowed for the duration of `perform` or `transact`
pub struct Context<'a> {
    state: MutexGuard<'a, ContextState>,
    store: RwLockReadGuard<'a, Snapshot>,
    next_seq: &'a AtomicU64,
}

impl Context<'_> {
    pub fn has_changes(&self) -> bool {
        self.state.has_changes()
    }

    /// Re-resolves a pin by id in this context
    pub fn pin(&self, id: &PinId) -> SyncResult<Pin> {
        let object_id = ObjectId::Pin(*id);
        if self.state.deleted.contains(&object_id) {
            return Err(SyncError::NotFound(format!("pin {id}")));
        }
        if let Some(Entity::Pin(pin)) = self.pending_insert(&object_id) {
            return Ok(pin);
        }
        self.store
            .pin(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("pin {id}")))
    }

    /// Re-resolves a photo by id in this context
    pub fn photo(&self, id: &PhotoId) -> SyncResult<Photo> {
        let object_id = ObjectId::Photo(*id);
        if self.state.deleted.contains(&object_id) {
            return Err(SyncError::NotFound(format!("photo {id}")));
        }
        if let Some(Entity::Photo(photo)) = self.pending_insert(&object_id) {
            return Ok(photo);
        }
        self.store
            .photo(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("photo {id}")))
    }

    fn pending_insert(&self, id: &ObjectId) -> Option<Entity> {
        self.state
            .inserted
            .iter()
            .find(|entity| entity.id() == *id)
            .cloned()
    }

    /// Runs a fetch request against the store overlaid with pending changes
    pub fn fetch(&self, request: &FetchRequest) -> Vec<Entity> {
        match request {
            FetchRequest::AllPins => self.pins_matching(|_| true),
            FetchRequest::PinsAt(coordinate) => {
                let coordinate = *coordinate;
                self.pins_matching(move |pin| pin.coordinate == coordinate)
            }
            FetchRequest::PhotosForPin(pin_id) => self
                .photos_for_pin(pin_id)
                .into_iter()
                .map(Entity::Photo)
                .collect(),
        }
    }

    fn pins_matching(&self, predicate: impl Fn(&Pin) -> bool) -> Vec<Entity> {
        let mut pins: Vec<Pin> = self
            .store
            .pins
            .values()
            .filter(|pin| !self.state.deleted.contains(&ObjectId::Pin(pin.id)))
            .cloned()
            .collect();
        pins.extend(self.state.inserted.iter().filter_map(|entity| match entity {
            Entity::Pin(pin) => Some(pin.clone()),
            Entity::Photo(_) => None,
        }));
        pins.retain(|pin| predicate(pin));
        pins.sort_by_key(|pin| pin.created_at);
        pins.into_iter().map(Entity::Pin).collect()
    }

    /// Photos for a pin, oldest first, as this context sees them
    pub fn photos_for_pin(&self, pin: &PinId) -> Vec<Photo> {
        let mut photos: Vec<Photo> = self
            .store
            .photos_for_pin(pin)
            .into_iter()
            .filter(|photo| !self.state.deleted.contains(&ObjectId::Photo(photo.id)))
            .cloned()
            .collect();
        photos.extend(self.state.inserted.iter().filter_map(|entity| match entity {
            Entity::Photo(photo) if photo.pin == *pin => Some(photo.clone()),
            _ => None,
        }));
        photos.sort_by_key(|photo| photo.seq);
        photos
    }

    pub fn pins_at(&self, coordinate: Coordinate) -> Vec<Pin> {
        self.fetch(&FetchRequest::PinsAt(coordinate))
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Pin(pin) => Some(pin),
                Entity::Photo(_) => None,
            })
            .collect()
    }

    pub fn all_pins(&self) -> Vec<Pin> {
        self.fetch(&FetchRequest::AllPins)
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Pin(pin) => Some(pin),
                Entity::Photo(_) => None,
            })
            .collect()
    }

    pub fn insert_pin(&mut self, coordinate: Coordinate) -> Pin {
        let pin = Pin {
            id: PinId::new(),
            coordinate,
            created_at: Utc::now(),
        };
        self.state.inserted.push(Entity::Pin(pin.clone()));
        pin
    }

    /// Inserts a photo owned by `pin`, which must have been resolved in this context
    pub fn insert_photo(&mut self, pin: &Pin, image: Vec<u8>, title: &str, source_url: &str) -> Photo {
        let photo = Photo {
            id: PhotoId::new(),
            pin: pin.id,
            image: Arc::new(image),
            title: title.to_string(),
            source_url: source_url.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            created_at: Utc::now(),
        };
        self.state.inserted.push(Entity::Photo(photo.clone()));
        photo
    }

    /// Marks an object deleted. Deleting a pin also deletes its photos.
    pub fn delete(&mut self, id: ObjectId) {
        let before = self.state.inserted.len();
        self.state.inserted.retain(|entity| match (entity, &id) {
            (entity, id) if entity.id() == *id => false,
            (Entity::Photo(photo), ObjectId::Pin(pin)) => photo.pin != *pin,
            _ => true,
        });
        let dropped_pending = before != self.state.inserted.len();

        let stored = match &id {
            ObjectId::Pin(pin) => self.store.pin(pin).is_some(),
            ObjectId::Photo(photo) => self.store.photo(photo).is_some(),
        };
        if stored || !dropped_pending {
            self.state.deleted.insert(id);
        }

        if let ObjectId::Pin(pin) = id {
            let owned: Vec<ObjectId> = self
                .store
                .photos_for_pin(&pin)
                .into_iter()
                .map(|photo| ObjectId::Photo(photo.id))
                .collect();
            self.state.deleted.extend(owned);
        }
    }
}

/// Owns the store and both contexts
pub struct PersistenceCoordinator {
    store: RwLock<Snapshot>,
    backend: Box<dyn StoreBackend>,
    /// Serializes commits; held across backend I/O instead of the store lock
    commit_lock: Mutex<()>,
    foreground: Mutex<ContextState>,
    background: Mutex<ContextState>,
    next_seq: AtomicU64,
    notifier: Arc<ChangeNotifier>,
}

impl PersistenceCoordinator {
    /// Opens the store through `backend`
    pub fn open(backend: Box<dyn StoreBackend>, notifier: Arc<ChangeNotifier>) -> anyhow::Result<Self> {
        let snapshot = backend.load()?;
        let next_seq = snapshot.max_seq() + 1;
        Ok(Self {
            store: RwLock::new(snapshot),
            backend,
            commit_lock: Mutex::new(()),
            foreground: Mutex::new(ContextState::default()),
            background: Mutex::new(ContextState::default()),
            next_seq: AtomicU64::new(next_seq),
            notifier,
        })
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    fn context_state(&self, kind: ContextKind) -> MutexGuard<'_, ContextState> {
        let lock = match kind {
            ContextKind::Foreground => &self.foreground,
            ContextKind::Background => &self.background,
        };
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_store(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with exclusive use of the `kind` context
    pub fn perform<R>(&self, kind: ContextKind, f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let mut context = Context {
            state: self.context_state(kind),
            store: self.read_store(),
            next_seq: &self.next_seq,
        };
        f(&mut context)
    }

    /// Runs `f` in the `kind` context and commits exactly the changes it made.
    ///
    /// Changes left pending by earlier `perform` calls are set aside while
    /// `f` runs and are neither committed nor discarded. If `f` fails, its
    /// changes are dropped. Transactions are serialized, so a lookup made in
    /// `f` still holds when its changes reach the store.
    pub fn transact<R>(
        &self,
        kind: ContextKind,
        f: impl FnOnce(&mut Context<'_>) -> SyncResult<R>,
    ) -> SyncResult<R> {
        let _serial = self.lock_commits();

        let (result, changes) = {
            let mut state = self.context_state(kind);
            let outer = state.take_changes();
            let mut context = Context {
                state,
                store: self.read_store(),
                next_seq: &self.next_seq,
            };
            let result = f(&mut context);
            let changes = context.state.take_changes();
            context.state.restore(outer);
            (result, changes)
        };

        let value = result?;
        self.commit(kind, changes)?;
        Ok(value)
    }

    /// Saves everything pending in the `kind` context. Returns the published
    /// notification, or `None` when there was nothing to save.
    pub fn save(&self, kind: ContextKind) -> SyncResult<Option<SaveNotification>> {
        let _serial = self.lock_commits();
        let changes = self.context_state(kind).take_changes();
        self.commit(kind, changes)
    }

    /// Applies `changes` to the store. Caller holds the commit lock.
    fn commit(&self, kind: ContextKind, changes: ChangeSet) -> SyncResult<Option<SaveNotification>> {
        if changes.is_empty() {
            return Ok(None);
        }

        // only commits change the store, and the caller holds the commit lock
        let mut next = self.read_store().clone();
        let applied = next.apply(&changes)?;

        if let Err(err) = self.backend.commit(&next, &changes) {
            error!("Failed to save {kind} context: {err:#}");
            return Err(SyncError::PersistenceFailure(format!("{err:#}")));
        }
        *self
            .store
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;

        for target in [kind.other(), kind] {
            self.context_state(target).merge(&applied);
        }

        let notification = SaveNotification {
            context: kind,
            inserted: applied.inserted.into_iter().collect(),
            updated: applied.updated.into_iter().collect(),
            deleted: applied.deleted.into_iter().collect(),
        };
        debug!(
            "Saved {} context: {} inserted, {} updated, {} deleted",
            kind,
            notification.inserted.len(),
            notification.updated.len(),
            notification.deleted.len()
        );
        self.notifier.post(Event::DidSave(notification.clone()));
        Ok(Some(notification))
    }

    /// Creates a pin at `coordinate`, or returns the one already there
    pub fn create_pin(&self, coordinate: Coordinate) -> SyncResult<Pin> {
        self.transact(ContextKind::Foreground, |ctx| {
            Ok(match ctx.pins_at(coordinate).into_iter().next() {
                Some(existing) => existing,
                None => ctx.insert_pin(coordinate),
            })
        })
    }

    pub fn all_pins(&self) -> Vec<Pin> {
        self.perform(ContextKind::Foreground, |ctx| ctx.all_pins())
    }

    pub fn photos_for_pin(&self, pin: &PinId) -> Vec<Photo> {
        self.perform(ContextKind::Foreground, |ctx| ctx.photos_for_pin(pin))
    }
}
