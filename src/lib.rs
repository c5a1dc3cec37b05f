//! # geoalbum
//!
//! Drop pins on a map and keep a locally persisted photo collection for each
//! one, drawn at random from photos geotagged near the pin.
//!
//! The first time a pin is opened its collection is fetched: a bounding box
//! is built around the pin, a random page of matching photos is picked from
//! the remote search service, and each photo is downloaded and saved in
//! turn. After that the pin is served from the local store until the user
//! asks for a new collection.
//!
//! ## Features
//!
//! - Two-phase random-page search against a Flickr-compatible endpoint
//! - Incremental download with per-photo progress events
//! - Foreground/background persistence contexts over one store, merged on save
//! - YAML store index with one image file per photo, surviving restarts
//! - At most one fetch in flight per pin; refresh, photo and pin deletion

pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod materializer;
pub mod mock;
pub mod model;
pub mod notifier;
pub mod persistence;
pub mod reachability;
pub mod search;
pub mod store;

pub use cache::{CollectionState, CycleOutcome, EnsureOutcome, PhotoCollectionCache, RefreshOutcome};
pub use error::{SyncError, SyncResult};
