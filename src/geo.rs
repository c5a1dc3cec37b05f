//! Coordinates and search bounding boxes for geoalbum.
//!
//! This module defines the `Coordinate` type used to place pins, with equality
//! at six decimal places (roughly a tenth of a meter), and the
//! `GeoBoundingBoxBuilder` that turns a coordinate into the clamped box sent
//! to the photo search service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Scale used to compare coordinates at six decimal places
const SIX_PLACES: f64 = 1_000_000.0;

/// Legal longitude range
pub const LON_RANGE: (f64, f64) = (-180.0, 180.0);
/// Legal latitude range
pub const LAT_RANGE: (f64, f64) = (-90.0, 90.0);

/// Why a latitude/longitude pair cannot be a pin position
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CoordinateError {
    #[error("latitude {0} is outside -90..=90")]
    InvalidLatitude(f64),
    #[error("longitude {0} is outside -180..=180")]
    InvalidLongitude(f64),
}

/// A geographic position in degrees
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Checked constructor for positions coming from user input
    pub fn try_new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        // NaN is contained in no range
        if !(LAT_RANGE.0..=LAT_RANGE.1).contains(&latitude) {
            return Err(CoordinateError::InvalidLatitude(latitude));
        }
        if !(LON_RANGE.0..=LON_RANGE.1).contains(&longitude) {
            return Err(CoordinateError::InvalidLongitude(longitude));
        }
        Ok(Self::new(latitude, longitude))
    }

    fn rounded(&self) -> (i64, i64) {
        (
            (self.latitude * SIX_PLACES).round() as i64,
            (self.longitude * SIX_PLACES).round() as i64,
        )
    }
}

// Two coordinates are equal if they match when rounded to 6 decimal places
impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.rounded() == other.rounded()
    }
}

impl Eq for Coordinate {}

impl Hash for Coordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rounded().hash(state);
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// Search area, edges in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Wire form expected by the search service: "minLon,minLat,maxLon,maxLat"
    pub fn to_query_value(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_query_value())
    }
}

/// Builds a fixed-size box around a coordinate, clamped to the globe
#[derive(Debug, Clone, Copy)]
pub struct GeoBoundingBoxBuilder {
    /// Degrees of longitude on each side of the center
    pub half_width: f64,
    /// Degrees of latitude above and below the center
    pub half_height: f64,
}

impl Default for GeoBoundingBoxBuilder {
    fn default() -> Self {
        Self {
            half_width: 1.0,
            half_height: 1.0,
        }
    }
}

impl GeoBoundingBoxBuilder {
    pub fn new(half_width: f64, half_height: f64) -> Self {
        Self {
            half_width,
            half_height,
        }
    }

    /// Computes the box for `lat`/`lon`. Each edge is clamped on its own axis.
    pub fn build(&self, lat: f64, lon: f64) -> BoundingBox {
        BoundingBox {
            min_lon: (lon - self.half_width).max(LON_RANGE.0),
            min_lat: (lat - self.half_height).max(LAT_RANGE.0),
            max_lon: (lon + self.half_width).min(LON_RANGE.1),
            max_lat: (lat + self.half_height).min(LAT_RANGE.1),
        }
    }

    pub fn build_for(&self, coordinate: &Coordinate) -> BoundingBox {
        self.build(coordinate.latitude, coordinate.longitude)
    }
}
