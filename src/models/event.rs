use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::ids::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Active,
    Lost,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Lost => "lost",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(EventStatus::Active),
            "lost" => Ok(EventStatus::Lost),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// One upstream record as decoded, before filtering.
///
/// The upstream feed is Spanish-keyed; the tag accessors resolve the aliases the
/// feed uses for the same concept.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// First non-empty value among `keys`, rendered as text. Numbers are accepted
    /// since the feed is not consistent about kilometre points and ids.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| match self.fields.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn source(&self) -> Option<String> {
        self.text(&["fuente"])
    }

    pub fn kind(&self) -> Option<String> {
        self.text(&["subtipoVialidad", "tipo", "tipoIncidencia"])
    }

    pub fn cause(&self) -> Option<String> {
        self.text(&["subcausa", "causa", "causaIncidencia"])
    }

    pub fn upstream_id(&self) -> Option<String> {
        self.text(&["id"])
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Canonical attributes of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAttributes {
    pub source: String,
    pub kind: String,
    pub cause: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub road: Option<String>,
    #[serde(default)]
    pub kilometre: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub municipality: Option<String>,
    /// Upstream start time, normalized to UTC.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Output of the normalizer: identity plus canonical fields, not yet timestamped.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub id: EventId,
    pub attributes: EventAttributes,
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(flatten)]
    pub attributes: EventAttributes,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: EventStatus,
    #[serde(default)]
    pub lost_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl Event {
    pub fn new(normalized: NormalizedEvent, observed_at: DateTime<Utc>) -> Self {
        Self {
            id: normalized.id,
            attributes: normalized.attributes,
            first_seen_at: observed_at,
            last_seen_at: observed_at,
            status: EventStatus::Active,
            lost_at: None,
            raw: normalized.raw,
        }
    }

    /// Re-sighting: latest attributes win, freshness never moves backwards.
    pub(crate) fn refresh(&mut self, normalized: NormalizedEvent, observed_at: DateTime<Utc>) {
        self.attributes = normalized.attributes;
        self.raw = normalized.raw;
        self.last_seen_at = self.last_seen_at.max(observed_at);
        self.status = EventStatus::Active;
        self.lost_at = None;
    }

    pub(crate) fn mark_lost(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Lost;
        self.lost_at = Some(now);
    }

    pub fn is_active(&self) -> bool {
        self.status == EventStatus::Active
    }

    /// Time since the last sighting; zero if `now` precedes it.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_seen_at).max(chrono::Duration::zero())
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
}

impl EventFilter {
    pub fn status(status: EventStatus) -> Self {
        Self { status: Some(status) }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.status.map_or(true, |status| event.status == status)
    }
}
