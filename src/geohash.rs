// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Geohash encoding for location channels.
//!
//! | Precision | Level | Approx. cell |
//! |-----------|----------|--------------|
//! | 3 | Region | ~156 km |
//! | 4 | City | ~39 km |
//! | 5 | District | ~5 km |
//! | 6 | Venue | ~1.2 km |
//! | 7 | Stage | ~150 m |
//! | 8 | Building | ~38 m |
//!
//! Every geohash is a prefix of the geohash of any point inside it at a
//! higher precision, which is what channel hierarchies rely on.

use serde::{Deserialize, Serialize};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest geohash accepted. 12 characters is below a few centimetres.
pub const MAX_PRECISION: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GeohashError {
    #[error("geohash is empty")]
    Empty,

    #[error("invalid geohash character {0:?}")]
    InvalidCharacter(char),

    #[error("coordinates out of range: ({lat}, {lon})")]
    InvalidCoordinates { lat: f64, lon: f64 },

    #[error("precision {0} outside 1..=12")]
    InvalidPrecision(usize),

    #[error("unknown precision level {0}, expected 3..=8")]
    UnknownLevel(u8),
}

/// Named channel sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Region,
    City,
    District,
    Venue,
    /// Concert-stage sized; the default.
    #[default]
    Stage,
    Building,
}

impl Precision {
    pub const ALL: [Precision; 6] = [
        Precision::Region,
        Precision::City,
        Precision::District,
        Precision::Venue,
        Precision::Stage,
        Precision::Building,
    ];

    /// Geohash length for this level.
    pub fn geohash_len(self) -> usize {
        match self {
            Precision::Region => 3,
            Precision::City => 4,
            Precision::District => 5,
            Precision::Venue => 6,
            Precision::Stage => 7,
            Precision::Building => 8,
        }
    }

    /// Approximate cell radius, for display.
    pub fn approximate_size(self) -> &'static str {
        match self {
            Precision::Region => "~156 km",
            Precision::City => "~39 km",
            Precision::District => "~5 km",
            Precision::Venue => "~1.2 km",
            Precision::Stage => "~150 m",
            Precision::Building => "~38 m",
        }
    }
}

impl TryFrom<u8> for Precision {
    type Error = GeohashError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Precision::ALL
            .into_iter()
            .find(|p| p.geohash_len() == value as usize)
            .ok_or(GeohashError::UnknownLevel(value))
    }
}

/// Encode a coordinate at `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String, GeohashError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(GeohashError::InvalidCoordinates { lat, lon });
    }
    if !(1..=MAX_PRECISION).contains(&precision) {
        return Err(GeohashError::InvalidPrecision(precision));
    }

    let (mut lat_range, mut lon_range) = ((-90.0, 90.0), (-180.0, 180.0));
    let mut hash = String::with_capacity(precision);
    let mut even_bit = true;
    let mut bits = 0u8;
    let mut bit_count = 0;

    while hash.len() < precision {
        let (range, value): (&mut (f64, f64), f64) = if even_bit {
            (&mut lon_range, lon)
        } else {
            (&mut lat_range, lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        bits <<= 1;
        if value >= mid {
            bits |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even_bit = !even_bit;

        bit_count += 1;
        if bit_count == 5 {
            hash.push(BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }
    Ok(hash)
}

/// Bounding box of a geohash: `((lat_min, lat_max), (lon_min, lon_max))`.
pub fn bounds(geohash: &str) -> Result<((f64, f64), (f64, f64)), GeohashError> {
    if geohash.is_empty() {
        return Err(GeohashError::Empty);
    }
    let (mut lat_range, mut lon_range) = ((-90.0, 90.0), (-180.0, 180.0));
    let mut even_bit = true;

    for c in geohash.chars() {
        let lower = c.to_ascii_lowercase();
        let index = BASE32
            .iter()
            .position(|&b| b as char == lower)
            .ok_or(GeohashError::InvalidCharacter(c))?;
        for shift in (0..5).rev() {
            let bit = (index >> shift) & 1 == 1;
            let range: &mut (f64, f64) = if even_bit { &mut lon_range } else { &mut lat_range };
            let mid = (range.0 + range.1) / 2.0;
            if bit {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even_bit = !even_bit;
        }
    }
    Ok((lat_range, lon_range))
}

/// Centre point of a geohash cell as `(lat, lon)`.
pub fn decode(geohash: &str) -> Result<(f64, f64), GeohashError> {
    let ((lat_min, lat_max), (lon_min, lon_max)) = bounds(geohash)?;
    Ok(((lat_min + lat_max) / 2.0, (lon_min + lon_max) / 2.0))
}

/// Every prefix from one character up to the full hash, shortest first.
pub fn hierarchy(geohash: &str) -> Vec<String> {
    geohash
        .char_indices()
        .map(|(i, c)| geohash[..i + c.len_utf8()].to_string())
        .collect()
}

/// Human-readable summary such as `"District (37.77, -122.41)"`.
pub fn describe(geohash: &str) -> Result<String, GeohashError> {
    let (lat, lon) = decode(geohash)?;
    let name = match geohash.len() {
        3 => "Region",
        4 => "City",
        5 => "District",
        6 => "Area",
        7 => "Venue",
        8 => "Building",
        _ => "Location",
    };
    Ok(format!("{name} ({lat:.2}, {lon:.2})"))
}

/// Whether two geohashes share a cell at `precision` characters.
pub fn shares_cell(a: &str, b: &str, precision: usize) -> bool {
    let a: String = a.chars().take(precision).collect();
    let b: String = b.chars().take(precision).collect();
    a.starts_with(&b) || b.starts_with(&a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_locations() {
        assert_eq!(encode(57.64911, 10.40744, 11).unwrap(), "u4pruydqqvj");
        assert_eq!(encode(37.7749, -122.4194, 5).unwrap(), "9q8yy");
    }

    #[test]
    fn encoding_is_deterministic_and_prefix_stable() {
        let (lat, lon) = (40.7580, -73.9855);
        for precision in Precision::ALL {
            let p = precision.geohash_len();
            let coarse = encode(lat, lon, p).unwrap();
            assert_eq!(coarse, encode(lat, lon, p).unwrap());
            assert_eq!(coarse.len(), p);
            assert!(encode(lat, lon, p + 1).unwrap().starts_with(&coarse));
        }
    }

    #[test]
    fn decode_returns_cell_centre() {
        let (lat, lon) = decode("u4pruydqqvj").unwrap();
        assert!((lat - 57.64911).abs() < 1e-4);
        assert!((lon - 10.40744).abs() < 1e-4);

        let ((lat_min, lat_max), (lon_min, lon_max)) = bounds("9q8yy").unwrap();
        assert!(lat_min <= 37.7749 && 37.7749 <= lat_max);
        assert!(lon_min <= -122.4194 && -122.4194 <= lon_max);
    }

    #[test]
    fn hierarchy_lists_every_prefix() {
        assert_eq!(hierarchy("9q8yy"), vec!["9", "9q", "9q8", "9q8y", "9q8yy"]);
        assert!(hierarchy("").is_empty());
    }

    #[test]
    fn describes_by_length() {
        assert_eq!(describe("9q8yy").unwrap(), "District (37.77, -122.41)");
        assert!(describe("9q8yyk").unwrap().starts_with("Area ("));
        assert!(describe("9q").unwrap().starts_with("Location ("));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(decode(""), Err(GeohashError::Empty));
        assert_eq!(decode("9qa"), Err(GeohashError::InvalidCharacter('a')));
        assert!(encode(91.0, 0.0, 5).is_err());
        assert_eq!(encode(0.0, 0.0, 0), Err(GeohashError::InvalidPrecision(0)));
        assert_eq!(Precision::try_from(9), Err(GeohashError::UnknownLevel(9)));
        assert_eq!(Precision::try_from(7), Ok(Precision::Stage));
    }

    #[test]
    fn nearby_cells_share_prefix() {
        assert!(shares_cell("9q8yyk", "9q8yy", 6));
        assert!(!shares_cell("9q8yy", "9q8z", 5));
    }
}
