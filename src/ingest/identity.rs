//! Stable event identity.
//!
//! The identity of an incident is derived from a fixed projection of its fields.
//! When the projection includes [`IdentityField::UpstreamId`] and the record carries
//! a non-empty `id`, that value is used verbatim. Otherwise the projected values are
//! joined with `|` (coordinates at 5 decimals, absent values as empty strings) and
//! hashed with SHA-256; the hex digest is the id.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::models::{EventAttributes, EventId, RawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityField {
    UpstreamId,
    Latitude,
    Longitude,
    Road,
    Kilometre,
    Cause,
    Kind,
    Source,
    /// UTC calendar day of the upstream start time.
    StartDay,
}

impl IdentityField {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityField::UpstreamId => "upstream_id",
            IdentityField::Latitude => "latitude",
            IdentityField::Longitude => "longitude",
            IdentityField::Road => "road",
            IdentityField::Kilometre => "kilometre",
            IdentityField::Cause => "cause",
            IdentityField::Kind => "kind",
            IdentityField::Source => "source",
            IdentityField::StartDay => "start_day",
        }
    }
}

impl fmt::Display for IdentityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "upstream_id" | "id" => IdentityField::UpstreamId,
            "latitude" | "lat" => IdentityField::Latitude,
            "longitude" | "lon" => IdentityField::Longitude,
            "road" => IdentityField::Road,
            "kilometre" | "km" => IdentityField::Kilometre,
            "cause" => IdentityField::Cause,
            "kind" | "type" => IdentityField::Kind,
            "source" => IdentityField::Source,
            "start_day" => IdentityField::StartDay,
            other => return Err(format!("unknown identity field: {}", other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProjection {
    fields: Vec<IdentityField>,
}

impl Default for IdentityProjection {
    fn default() -> Self {
        Self {
            fields: vec![
                IdentityField::UpstreamId,
                IdentityField::Latitude,
                IdentityField::Longitude,
                IdentityField::Road,
                IdentityField::Kilometre,
                IdentityField::Cause,
                IdentityField::Kind,
            ],
        }
    }
}

impl IdentityProjection {
    pub fn new(fields: Vec<IdentityField>) -> Result<Self, String> {
        let mut unique = Vec::with_capacity(fields.len());
        for field in fields {
            if !unique.contains(&field) {
                unique.push(field);
            }
        }
        // upstream_id alone would hash every id-less record to the same value
        if unique.iter().all(|field| *field == IdentityField::UpstreamId) {
            return Err("identity projection needs at least one field besides upstream_id".to_string());
        }
        Ok(Self { fields: unique })
    }

    pub fn fields(&self) -> &[IdentityField] {
        &self.fields
    }

    pub fn derive(&self, record: &RawRecord, attributes: &EventAttributes) -> EventId {
        if self.fields.contains(&IdentityField::UpstreamId) {
            if let Some(id) = record.upstream_id() {
                return EventId::new(id);
            }
        }
        let fingerprint = self
            .fields
            .iter()
            .filter(|field| **field != IdentityField::UpstreamId)
            .map(|field| projected_value(*field, attributes))
            .collect::<Vec<_>>()
            .join("|");

        let mut hasher = Sha256::new();
        hasher.update(fingerprint.as_bytes());
        EventId::new(format!("{:x}", hasher.finalize()))
    }
}

impl FromStr for IdentityProjection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(IdentityField::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(fields)
    }
}

fn projected_value(field: IdentityField, attributes: &EventAttributes) -> String {
    let text = |value: &Option<String>| value.clone().unwrap_or_default();
    match field {
        IdentityField::UpstreamId => String::new(),
        IdentityField::Latitude => format!("{:.5}", attributes.latitude),
        IdentityField::Longitude => format!("{:.5}", attributes.longitude),
        IdentityField::Road => text(&attributes.road),
        IdentityField::Kilometre => text(&attributes.kilometre),
        IdentityField::Cause => attributes.cause.clone(),
        IdentityField::Kind => attributes.kind.clone(),
        IdentityField::Source => attributes.source.clone(),
        IdentityField::StartDay => attributes
            .started_at
            .map(|at| at.date_naive().to_string())
            .unwrap_or_default(),
    }
}
