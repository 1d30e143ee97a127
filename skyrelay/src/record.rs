//! Telemetry records and their region-specific wire formats.
//!
//! Every drone reports the same four measurements but each region encodes
//! them differently on the wire:
//!
//! | Region | Wire format    |
//! |--------|----------------|
//! | Norte  | `p-r-t-h`      |
//! | Sul    | `(p;r;t;h)`    |
//! | Leste  | `{p,r,t,h}`    |
//! | Oeste  | `p#r#t#h`      |
//!
//! where the raw tuple order is pressure, radiation, temperature, humidity.
//! Nodes normalize every payload into the canonical form
//! `[temperature//humidity//pressure//radiation]`, each value with two
//! decimals.
//!
//! # Example
//!
//! ```rust
//! use skyrelay::record::{normalize_for, Region};
//!
//! let canonical = normalize_for(Region::Sul, "(1010.00;500.00;15.00;70.00)").unwrap();
//! assert_eq!(canonical, "[15.00//70.00//1010.00//500.00]");
//! ```

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Candidate delimiters, in detection priority order.
pub const DELIMITERS: [char; 4] = ['-', ';', ',', '#'];

/// Bracket characters stripped before splitting.
const BRACKETS: [char; 6] = ['(', ')', '{', '}', '[', ']'];

/// Separator between fields of the canonical form.
const CANONICAL_SEPARATOR: &str = "//";

/// One of the four fixed sensor zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    /// North: hyphen-delimited, no brackets.
    Norte,
    /// South: semicolon-delimited inside parentheses.
    Sul,
    /// East: comma-delimited inside braces.
    Leste,
    /// West: hash-delimited, no brackets.
    Oeste,
}

/// Inclusive sampling range for each measurement of a region.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRanges {
    /// Atmospheric pressure, hPa.
    pub pressure: RangeInclusive<f64>,
    /// Solar radiation, W/m².
    pub radiation: RangeInclusive<f64>,
    /// Temperature, °C.
    pub temperature: RangeInclusive<f64>,
    /// Relative humidity, %.
    pub humidity: RangeInclusive<f64>,
}

impl Region {
    /// All regions in declaration order.
    pub const ALL: [Region; 4] = [Region::Norte, Region::Sul, Region::Leste, Region::Oeste];

    /// Display name, also used as the drone's source identity.
    pub fn name(self) -> &'static str {
        match self {
            Region::Norte => "Norte",
            Region::Sul => "Sul",
            Region::Leste => "Leste",
            Region::Oeste => "Oeste",
        }
    }

    /// Field delimiter of this region's wire format.
    pub fn delimiter(self) -> char {
        match self {
            Region::Norte => '-',
            Region::Sul => ';',
            Region::Leste => ',',
            Region::Oeste => '#',
        }
    }

    /// Opening and closing bracket wrapping this region's payloads, if any.
    pub fn brackets(self) -> Option<(char, char)> {
        match self {
            Region::Sul => Some(('(', ')')),
            Region::Leste => Some(('{', '}')),
            Region::Norte | Region::Oeste => None,
        }
    }

    /// Sampling ranges used by the drone simulator. Informational only;
    /// parsing never enforces them.
    pub fn ranges(self) -> SensorRanges {
        match self {
            Region::Norte => SensorRanges {
                pressure: 950.0..=1000.0,
                radiation: 800.0..=1200.0,
                temperature: 30.0..=40.0,
                humidity: 70.0..=90.0,
            },
            Region::Sul => SensorRanges {
                pressure: 1000.0..=1050.0,
                radiation: 400.0..=800.0,
                temperature: 10.0..=20.0,
                humidity: 60.0..=80.0,
            },
            Region::Leste => SensorRanges {
                pressure: 970.0..=1030.0,
                radiation: 600.0..=1000.0,
                temperature: 25.0..=35.0,
                humidity: 50.0..=70.0,
            },
            Region::Oeste => SensorRanges {
                pressure: 980.0..=1020.0,
                radiation: 500.0..=900.0,
                temperature: 20.0..=30.0,
                humidity: 55.0..=75.0,
            },
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for Region {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .into_iter()
            .find(|region| region.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RecordError::UnknownRegion(s.to_string()))
    }
}

/// A single drone reading, tagged with the region it was taken in.
///
/// Records are created by the simulator, encoded once into their region's
/// wire format, and never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    /// Region the drone flies over.
    pub region: Region,
    /// Atmospheric pressure, hPa.
    pub pressure: f64,
    /// Solar radiation, W/m².
    pub radiation: f64,
    /// Temperature, °C.
    pub temperature: f64,
    /// Relative humidity, %.
    pub humidity: f64,
}

impl Record {
    /// Creates a record from raw tuple order (pressure, radiation,
    /// temperature, humidity).
    pub fn new(region: Region, pressure: f64, radiation: f64, temperature: f64, humidity: f64) -> Self {
        Self {
            region,
            pressure,
            radiation,
            temperature,
            humidity,
        }
    }

    /// Encodes the record in its region's wire format.
    pub fn encode(&self) -> String {
        let delimiter = self.region.delimiter().to_string();
        let body = [self.pressure, self.radiation, self.temperature, self.humidity]
            .iter()
            .map(|value| format!("{value:.2}"))
            .collect::<Vec<_>>()
            .join(&delimiter);

        match self.region.brackets() {
            Some((open, close)) => format!("{open}{body}{close}"),
            None => body,
        }
    }

    /// The measurements without the region tag.
    pub fn reading(&self) -> Reading {
        Reading {
            temperature: self.temperature,
            humidity: self.humidity,
            pressure: self.pressure,
            radiation: self.radiation,
        }
    }

    /// The canonical `[t//h//p//r]` form.
    pub fn canonical(&self) -> String {
        self.reading().canonical()
    }
}

/// The four measurements of a normalized record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Temperature, °C.
    pub temperature: f64,
    /// Relative humidity, %.
    pub humidity: f64,
    /// Atmospheric pressure, hPa.
    pub pressure: f64,
    /// Solar radiation, W/m².
    pub radiation: f64,
}

impl Reading {
    /// Renders the canonical `[temperature//humidity//pressure//radiation]`
    /// string with two decimals per value.
    pub fn canonical(&self) -> String {
        format!(
            "[{:.2}//{:.2}//{:.2}//{:.2}]",
            self.temperature, self.humidity, self.pressure, self.radiation
        )
    }

    /// Parses a canonical string back into its measurements.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::InvalidCanonical`] if the brackets or field
    /// count are wrong, or [`RecordError::InvalidNumber`] for a bad value.
    pub fn from_canonical(s: &str) -> Result<Self, RecordError> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| RecordError::InvalidCanonical(s.to_string()))?;

        let fields: Vec<&str> = inner.split(CANONICAL_SEPARATOR).collect();
        if fields.len() != 4 {
            return Err(RecordError::InvalidCanonical(s.to_string()));
        }

        let [temperature, humidity, pressure, radiation] = parse_numbers(&fields)?;
        Ok(Self {
            temperature,
            humidity,
            pressure,
            radiation,
        })
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Parses a raw payload of unknown origin.
///
/// Brackets are stripped, then the delimiter is detected from
/// [`DELIMITERS`]. A payload carrying more than one candidate delimiter is
/// rejected instead of being split on whichever comes first, since a stray
/// `-` from a negative value would otherwise silently pick the wrong one.
///
/// # Errors
///
/// Returns a [`RecordError`] describing why the payload is malformed.
pub fn parse_fields(payload: &str) -> Result<Reading, RecordError> {
    let cleaned: String = payload.trim().chars().filter(|c| !BRACKETS.contains(c)).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(RecordError::Empty);
    }

    let found: Vec<char> = DELIMITERS.into_iter().filter(|d| cleaned.contains(*d)).collect();
    let delimiter = match found.as_slice() {
        [] => {
            return Err(RecordError::UnknownDelimiter {
                payload: payload.to_string(),
            });
        }
        [single] => *single,
        _ => {
            return Err(RecordError::AmbiguousDelimiter {
                found,
                payload: payload.to_string(),
            });
        }
    };

    split_reading(cleaned, delimiter, payload)
}

/// Parses a raw payload that claims to come from `region`.
///
/// The payload must be wrapped in the region's own bracket pair, if it has
/// one, and is split on the region's delimiter, so a Leste payload written
/// with hyphens fails the field count rather than being accepted under
/// another region's rule.
///
/// # Errors
///
/// Returns [`RecordError::RegionMismatch`] for missing or foreign brackets,
/// or the
/// field-level errors of [`parse_fields`].
pub fn parse_fields_for(region: Region, payload: &str) -> Result<Reading, RecordError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(RecordError::Empty);
    }

    let mismatch = || RecordError::RegionMismatch {
        region: region.to_string(),
        payload: payload.to_string(),
    };

    let body = match region.brackets() {
        Some((open, close)) => trimmed
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
            .ok_or_else(mismatch)?,
        None => trimmed,
    };

    if body.contains(BRACKETS) {
        return Err(mismatch());
    }

    split_reading(body.trim(), region.delimiter(), payload)
}

/// Normalizes a raw payload of unknown origin into canonical form.
///
/// # Errors
///
/// See [`parse_fields`].
pub fn normalize(payload: &str) -> Result<String, RecordError> {
    parse_fields(payload).map(|reading| reading.canonical())
}

/// Normalizes a raw payload from a known region into canonical form.
///
/// # Errors
///
/// See [`parse_fields_for`].
pub fn normalize_for(region: Region, payload: &str) -> Result<String, RecordError> {
    parse_fields_for(region, payload).map(|reading| reading.canonical())
}

/// Splits on `delimiter` and maps raw positions (p, r, t, h) to a reading.
fn split_reading(body: &str, delimiter: char, original: &str) -> Result<Reading, RecordError> {
    let fields: Vec<&str> = body.split(delimiter).collect();
    if fields.len() != 4 {
        return Err(RecordError::FieldCount {
            delimiter,
            count: fields.len(),
            payload: original.to_string(),
        });
    }

    let [pressure, radiation, temperature, humidity] = parse_numbers(&fields)?;
    Ok(Reading {
        temperature,
        humidity,
        pressure,
        radiation,
    })
}

fn parse_numbers(fields: &[&str]) -> Result<[f64; 4], RecordError> {
    let mut values = [0.0; 4];
    for (index, field) in fields.iter().enumerate().take(4) {
        let trimmed = field.trim();
        values[index] = trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| RecordError::InvalidNumber {
                index,
                field: trimmed.to_string(),
            })?;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 0.005, "{a} != {b}");
    }

    #[test]
    fn test_region_wire_formats() {
        let values = (1010.5, 500.25, 15.0, 70.75);
        let encode = |region| Record::new(region, values.0, values.1, values.2, values.3).encode();

        assert_eq!(encode(Region::Norte), "1010.50-500.25-15.00-70.75");
        assert_eq!(encode(Region::Sul), "(1010.50;500.25;15.00;70.75)");
        assert_eq!(encode(Region::Leste), "{1010.50,500.25,15.00,70.75}");
        assert_eq!(encode(Region::Oeste), "1010.50#500.25#15.00#70.75");
    }

    #[test]
    fn test_encode_then_normalize_preserves_values() {
        for region in Region::ALL {
            let ranges = region.ranges();
            let record = Record::new(
                region,
                *ranges.pressure.start(),
                *ranges.radiation.end(),
                *ranges.temperature.start() + 0.37,
                *ranges.humidity.end() - 1.11,
            );

            let reading = parse_fields(&record.encode()).unwrap();
            assert_close(reading.pressure, record.pressure);
            assert_close(reading.radiation, record.radiation);
            assert_close(reading.temperature, record.temperature);
            assert_close(reading.humidity, record.humidity);

            let tagged = parse_fields_for(region, &record.encode()).unwrap();
            assert_eq!(tagged, reading, "region-aware parse differs for {region}");
        }
    }

    #[test]
    fn test_sul_payload_normalizes_to_canonical() {
        assert_eq!(
            normalize_for(Region::Sul, "(1010.00;500.00;15.00;70.00)").unwrap(),
            "[15.00//70.00//1010.00//500.00]"
        );
        assert_eq!(
            normalize("(1010.00;500.00;15.00;70.00)").unwrap(),
            "[15.00//70.00//1010.00//500.00]"
        );
    }

    #[test]
    fn test_leste_with_hyphens_is_malformed() {
        assert!(matches!(
            normalize_for(Region::Leste, "970.10-650.20-28.50-60.00"),
            Err(RecordError::RegionMismatch { .. })
        ));

        let err = normalize_for(Region::Leste, "{970.10-650.20-28.50-60.00}").unwrap_err();
        assert!(matches!(
            err,
            RecordError::FieldCount {
                delimiter: ',',
                count: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_delimiter() {
        assert!(matches!(
            normalize("1010.00|500.00|15.00|70.00"),
            Err(RecordError::UnknownDelimiter { .. })
        ));
    }

    #[test]
    fn test_wrong_field_count() {
        assert!(matches!(
            normalize("1010.00#500.00#15.00"),
            Err(RecordError::FieldCount { count: 3, .. })
        ));
    }

    #[test]
    fn test_negative_value_is_ambiguous_without_region() {
        let payload = "1010.00#500.00#-5.00#70.00";
        assert!(matches!(
            normalize(payload),
            Err(RecordError::AmbiguousDelimiter { .. })
        ));

        // With the region known the hyphen is just a sign.
        assert_eq!(
            normalize_for(Region::Oeste, payload).unwrap(),
            "[-5.00//70.00//1010.00//500.00]"
        );
    }

    #[test]
    fn test_foreign_brackets_rejected_for_region() {
        assert!(matches!(
            normalize_for(Region::Sul, "{1010.00;500.00;15.00;70.00}"),
            Err(RecordError::RegionMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_brackets_rejected_for_region() {
        for payload in ["1;2;3;4", "(1;2;3;4", "1;2;3;4)"] {
            assert!(matches!(
                normalize_for(Region::Sul, payload),
                Err(RecordError::RegionMismatch { .. })
            ));
        }
        assert!(normalize_for(Region::Sul, " (1;2;3;4) ").is_ok());
    }

    #[test]
    fn test_non_numeric_and_non_finite_fields() {
        assert!(matches!(
            normalize("1010.00#abc#15.00#70.00"),
            Err(RecordError::InvalidNumber { index: 1, .. })
        ));
        assert!(matches!(
            normalize("1010.00#inf#15.00#70.00"),
            Err(RecordError::InvalidNumber { index: 1, .. })
        ));
        assert_eq!(normalize("  ()  "), Err(RecordError::Empty));
    }

    #[test]
    fn test_canonical_round_trip() {
        let reading = Reading::from_canonical("[15.00//70.00//1010.00//500.00]").unwrap();
        assert_close(reading.temperature, 15.0);
        assert_close(reading.radiation, 500.0);
        assert_eq!(reading.canonical(), "[15.00//70.00//1010.00//500.00]");

        assert!(Reading::from_canonical("15.00//70.00//1010.00//500.00").is_err());
        assert!(Reading::from_canonical("[15.00//70.00//1010.00]").is_err());
    }

    #[test]
    fn test_region_from_str() {
        assert_eq!("sul".parse::<Region>().unwrap(), Region::Sul);
        assert_eq!(" LESTE ".parse::<Region>().unwrap(), Region::Leste);
        assert!("centro".parse::<Region>().is_err());
    }
}
