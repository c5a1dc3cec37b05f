//! Persistent entities: pins and the photos they own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::geo::Coordinate;

/// Store-assigned identity of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinId(pub Uuid);

/// Store-assigned identity of a photo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhotoId(pub Uuid);

impl PinId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl PhotoId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PinId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for PhotoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PinId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl FromStr for PhotoId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A user-placed geographic anchor. Coordinates are set once, at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: PinId,
    pub coordinate: Coordinate,
    pub created_at: DateTime<Utc>,
}

/// A downloaded image belonging to exactly one pin
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub id: PhotoId,
    /// Owning pin
    pub pin: PinId,
    /// Raw image bytes, shared between contexts without copying
    pub image: Arc<Vec<u8>>,
    pub title: String,
    pub source_url: String,
    /// Insertion order within the store
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

/// Identity of any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Pin(PinId),
    Photo(PhotoId),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Pin(id) => write!(f, "pin {id}"),
            ObjectId::Photo(id) => write!(f, "photo {id}"),
        }
    }
}

/// Any stored object
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Pin(Pin),
    Photo(Photo),
}

impl Entity {
    pub fn id(&self) -> ObjectId {
        match self {
            Entity::Pin(pin) => ObjectId::Pin(pin.id),
            Entity::Photo(photo) => ObjectId::Photo(photo.id),
        }
    }
}

/// Predicates understood by `fetch`
#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
    AllPins,
    /// Pins whose coordinate equals this one at six decimal places
    PinsAt(Coordinate),
    /// Photos owned by a pin, in insertion order
    PhotosForPin(PinId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_parse_from_display() {
        let pin = PinId::new();
        let parsed: PinId = pin.to_string().parse().unwrap();
        assert_eq!(parsed, pin);

        assert!("not-a-uuid".parse::<PhotoId>().is_err());
    }

    #[test]
    fn test_entity_id() {
        let pin = Pin {
            id: PinId::new(),
            coordinate: Coordinate::new(41.8781, -87.6298),
            created_at: Utc::now(),
        };
        let id = pin.id;
        assert_eq!(Entity::Pin(pin).id(), ObjectId::Pin(id));
    }
}
