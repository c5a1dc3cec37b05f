//! The single underlying store behind both persistence contexts.
//!
//! `Snapshot` is the committed state: every pin and photo the store knows
//! about. Contexts hand their pending work to the store as a `ChangeSet`, which
//! is applied to a copy of the snapshot and then written through a
//! `StoreBackend`. Only when the backend accepts the write does the new
//! snapshot replace the old one.
//!
//! Two backends are provided:
//! - `YamlBackend` keeps a YAML index plus one image file per photo under a
//!   data directory, so collections survive restarts
//! - `MemoryBackend` keeps nothing on disk

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::model::{Entity, ObjectId, Photo, PhotoId, Pin, PinId};

/// Committed contents of the store
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub pins: HashMap<PinId, Pin>,
    pub photos: HashMap<PhotoId, Photo>,
}

/// Pending work handed from a context to the store
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub inserted: Vec<Entity>,
    pub deleted: Vec<ObjectId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }

    /// Whether any photo is being inserted
    pub fn inserts_photos(&self) -> bool {
        self.inserted
            .iter()
            .any(|entity| matches!(entity, Entity::Photo(_)))
    }
}

/// Identities touched by one applied change set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub inserted: BTreeSet<ObjectId>,
    pub updated: BTreeSet<ObjectId>,
    pub deleted: BTreeSet<ObjectId>,
}

impl Snapshot {
    pub fn pin(&self, id: &PinId) -> Option<&Pin> {
        self.pins.get(id)
    }

    pub fn photo(&self, id: &PhotoId) -> Option<&Photo> {
        self.photos.get(id)
    }

    /// Photos owned by `pin`, oldest first
    pub fn photos_for_pin(&self, pin: &PinId) -> Vec<&Photo> {
        let mut photos: Vec<&Photo> = self.photos.values().filter(|p| p.pin == *pin).collect();
        photos.sort_by_key(|p| p.seq);
        photos
    }

    pub fn max_seq(&self) -> u64 {
        self.photos.values().map(|p| p.seq).max().unwrap_or(0)
    }

    /// Applies `changes` in place. Deletes run first and a pin deletion
    /// cascades to its photos. A photo whose pin is gone is rejected.
    pub fn apply(&mut self, changes: &ChangeSet) -> SyncResult<AppliedChanges> {
        let mut applied = AppliedChanges::default();
        let mut touched_pins = BTreeSet::new();

        for id in &changes.deleted {
            match id {
                ObjectId::Pin(pin_id) => {
                    if self.pins.remove(pin_id).is_some() {
                        applied.deleted.insert(*id);
                    }
                    let owned: Vec<PhotoId> = self
                        .photos
                        .values()
                        .filter(|p| p.pin == *pin_id)
                        .map(|p| p.id)
                        .collect();
                    for photo_id in owned {
                        self.photos.remove(&photo_id);
                        applied.deleted.insert(ObjectId::Photo(photo_id));
                    }
                }
                ObjectId::Photo(photo_id) => {
                    // already gone means another context deleted it first
                    if let Some(photo) = self.photos.remove(photo_id) {
                        applied.deleted.insert(*id);
                        touched_pins.insert(photo.pin);
                    }
                }
            }
        }

        for entity in &changes.inserted {
            match entity {
                Entity::Pin(pin) => {
                    self.pins.insert(pin.id, pin.clone());
                }
                Entity::Photo(photo) => {
                    if !self.pins.contains_key(&photo.pin) {
                        return Err(SyncError::NotFound(format!(
                            "pin {} for photo {}",
                            photo.pin, photo.id
                        )));
                    }
                    touched_pins.insert(photo.pin);
                    self.photos.insert(photo.id, photo.clone());
                }
            }
            applied.inserted.insert(entity.id());
        }

        for pin_id in touched_pins {
            let id = ObjectId::Pin(pin_id);
            if self.pins.contains_key(&pin_id) && !applied.inserted.contains(&id) {
                applied.updated.insert(id);
            }
        }

        Ok(applied)
    }
}

/// Durable storage under the snapshot
pub trait StoreBackend: Send + Sync {
    /// Reads everything previously committed
    fn load(&self) -> Result<Snapshot>;

    /// Persists `snapshot`, which already includes `changes`
    fn commit(&self, snapshot: &Snapshot, changes: &ChangeSet) -> Result<()>;
}

/// Backend that keeps nothing outside the process
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl StoreBackend for MemoryBackend {
    fn load(&self) -> Result<Snapshot> {
        Ok(Snapshot::default())
    }

    fn commit(&self, _snapshot: &Snapshot, _changes: &ChangeSet) -> Result<()> {
        Ok(())
    }
}

/// Photo metadata as written to the index file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhotoRecord {
    id: PhotoId,
    pin: PinId,
    title: String,
    source_url: String,
    seq: u64,
    created_at: DateTime<Utc>,
    /// Image file, relative to the data directory
    file: PathBuf,
}

/// On-disk index of pins and photos
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreIndex {
    last_updated: DateTime<Utc>,
    pins: Vec<Pin>,
    photos: Vec<PhotoRecord>,
}

/// Backend storing `index.yaml` and `photos/<pin>/<photo>.jpg` under a directory
#[derive(Debug, Clone)]
pub struct YamlBackend {
    data_dir: PathBuf,
}

impl YamlBackend {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index.yaml")
    }

    fn relative_photo_path(pin: &PinId, photo: &PhotoId) -> PathBuf {
        Path::new("photos")
            .join(pin.to_string())
            .join(format!("{photo}.jpg"))
    }

    fn pin_dir(&self, pin: &PinId) -> PathBuf {
        self.data_dir.join("photos").join(pin.to_string())
    }
}

impl StoreBackend for YamlBackend {
    fn load(&self) -> Result<Snapshot> {
        let index_path = self.index_path();
        if !index_path.exists() {
            return Ok(Snapshot::default());
        }

        let yaml = fs::read_to_string(&index_path)
            .with_context(|| format!("Failed to read store index from {}", index_path.display()))?;
        let index: StoreIndex = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse store index from {}", index_path.display()))?;

        let mut snapshot = Snapshot::default();
        for pin in index.pins {
            snapshot.pins.insert(pin.id, pin);
        }

        for record in index.photos {
            let path = self.data_dir.join(&record.file);
            let image = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping photo {}: cannot read {}: {}", record.id, path.display(), e);
                    continue;
                }
            };
            snapshot.photos.insert(
                record.id,
                Photo {
                    id: record.id,
                    pin: record.pin,
                    image: Arc::new(image),
                    title: record.title,
                    source_url: record.source_url,
                    seq: record.seq,
                    created_at: record.created_at,
                },
            );
        }

        debug!(
            "Loaded store with {} pins and {} photos",
            snapshot.pins.len(),
            snapshot.photos.len()
        );
        Ok(snapshot)
    }

    fn commit(&self, snapshot: &Snapshot, changes: &ChangeSet) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data directory {}", self.data_dir.display()))?;

        for entity in &changes.inserted {
            if let Entity::Photo(photo) = entity {
                let path = self
                    .data_dir
                    .join(Self::relative_photo_path(&photo.pin, &photo.id));
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, photo.image.as_slice())
                    .with_context(|| format!("Failed to write photo to {}", path.display()))?;
            }
        }

        let mut pins: Vec<Pin> = snapshot.pins.values().cloned().collect();
        pins.sort_by_key(|p| p.created_at);
        let mut photos: Vec<PhotoRecord> = snapshot
            .photos
            .values()
            .map(|p| PhotoRecord {
                id: p.id,
                pin: p.pin,
                title: p.title.clone(),
                source_url: p.source_url.clone(),
                seq: p.seq,
                created_at: p.created_at,
                file: Self::relative_photo_path(&p.pin, &p.id),
            })
            .collect();
        photos.sort_by_key(|p| p.seq);

        let index = StoreIndex {
            last_updated: Utc::now(),
            pins,
            photos,
        };
        let yaml = serde_yaml::to_string(&index).context("Failed to serialize store index to YAML")?;

        // write then rename so a crash never leaves a truncated index
        let index_path = self.index_path();
        let tmp_path = index_path.with_extension("yaml.tmp");
        fs::write(&tmp_path, yaml)
            .with_context(|| format!("Failed to write store index to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &index_path)
            .with_context(|| format!("Failed to replace store index at {}", index_path.display()))?;

        // image files go last: the index no longer references them
        for id in &changes.deleted {
            match id {
                ObjectId::Pin(pin_id) => {
                    let dir = self.pin_dir(pin_id);
                    if dir.exists() {
                        if let Err(e) = fs::remove_dir_all(&dir) {
                            warn!("Failed to remove photo directory {}: {}", dir.display(), e);
                        }
                    }
                }
                ObjectId::Photo(photo_id) => {
                    let dir = self.data_dir.join("photos");
                    let Ok(entries) = fs::read_dir(&dir) else {
                        continue;
                    };
                    for entry in entries.flatten() {
                        let path = entry.path().join(format!("{photo_id}.jpg"));
                        if path.exists() {
                            if let Err(e) = fs::remove_file(&path) {
                                warn!("Failed to remove photo file {}: {}", path.display(), e);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
