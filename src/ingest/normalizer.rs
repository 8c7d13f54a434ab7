//! Record filtering and canonicalization.
//!
//! `Normalizer::normalize` is pure: no shared state, safe to call from any task.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use super::identity::IdentityProjection;
use crate::config::NormalizerConfig;
use crate::models::{EventAttributes, NormalizedEvent, RawRecord};
use crate::utils::time::parse_timestamp;

/// Attribute values a record must carry to be tracked. Source is compared exactly,
/// kind and cause case-insensitively; all after trimming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredAttributes {
    pub source: String,
    pub kind: String,
    pub cause: String,
}

impl Default for RequiredAttributes {
    fn default() -> Self {
        Self {
            source: "DGT3.0".to_string(),
            kind: "advertencia".to_string(),
            cause: "vehículo detenido".to_string(),
        }
    }
}

impl RequiredAttributes {
    pub fn matches(&self, record: &RawRecord) -> bool {
        let source_ok = record.source().as_deref() == Some(self.source.trim());
        source_ok
            && eq_folded(record.kind().as_deref(), &self.kind)
            && eq_folded(record.cause().as_deref(), &self.cause)
    }
}

fn eq_folded(value: Option<&str>, expected: &str) -> bool {
    value.map_or(false, |v| v.trim().to_lowercase() == expected.trim().to_lowercase())
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    required: RequiredAttributes,
    identity: IdentityProjection,
    retain_raw: bool,
    timezone: Tz,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            required: config.required.clone(),
            identity: config.identity.clone(),
            retain_raw: config.retain_raw,
            timezone: config.timezone,
        }
    }

    /// `None` when the record is filtered out or has no usable location.
    /// `observed_at` bounds the upstream start time so it never lies in the future.
    pub fn normalize(&self, record: &RawRecord, observed_at: DateTime<Utc>) -> Option<NormalizedEvent> {
        if !self.required.matches(record) {
            return None;
        }
        let (latitude, longitude) = extract_coordinates(record)?;

        let started_at = ["fechaInicio", "fecha_inicio"]
            .iter()
            .find_map(|key| record.text(&[*key]))
            .and_then(|text| parse_timestamp(&text, self.timezone))
            .map(|started| started.min(observed_at));

        let attributes = EventAttributes {
            source: record.source().unwrap_or_default(),
            kind: record.kind().unwrap_or_default(),
            cause: record.cause().unwrap_or_default(),
            latitude,
            longitude,
            road: record.text(&["carretera", "via", "road"]),
            kilometre: record.text(&["pkIni", "pkFin", "pk", "pK", "puntoKilometrico"]),
            province: record.text(&["provinciaIni", "provincia", "province"]),
            municipality: record.text(&["municipioIni", "municipio", "poblacion"]),
            started_at,
        };
        let id = self.identity.derive(record, &attributes);

        Some(NormalizedEvent {
            id,
            attributes,
            raw: self.retain_raw.then(|| record.to_value()),
        })
    }

    pub fn normalize_all(&self, records: &[RawRecord], observed_at: DateTime<Utc>) -> Vec<NormalizedEvent> {
        records
            .iter()
            .filter_map(|record| self.normalize(record, observed_at))
            .collect()
    }
}

/// (latitude, longitude). GeoJSON geometry first, flat fields second.
fn extract_coordinates(record: &RawRecord) -> Option<(f64, f64)> {
    let geometry = record.get("geometria").or_else(|| record.get("geometry"));
    if let Some(point) = geometry.and_then(geometry_point) {
        return Some(point);
    }
    let lat = ["lat", "latitud", "latitude"].iter().find_map(|k| record.get(k).and_then(as_f64))?;
    let lon = ["lon", "longitud", "longitude"].iter().find_map(|k| record.get(k).and_then(as_f64))?;
    Some((lat, lon))
}

fn geometry_point(geometry: &Value) -> Option<(f64, f64)> {
    // some feeds ship geometry as an embedded JSON string
    let parsed;
    let geometry = match geometry {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text).ok()?;
            &parsed
        }
        other => other,
    };
    let coordinates = geometry.get("coordinates")?.as_array()?;
    let position = match geometry.get("type")?.as_str()? {
        "Point" => coordinates,
        "LineString" | "MultiPoint" => coordinates.first()?.as_array()?,
        _ => return None,
    };
    if position.len() < 2 {
        return None;
    }
    Some((as_f64(&position[1])?, as_f64(&position[0])?))
}

fn as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}
