//! Shared types: event entity, status, identity. Timestamps are `DateTime<Utc>` throughout.

pub mod event;
pub mod ids;

pub use event::{Event, EventAttributes, EventFilter, EventStatus, NormalizedEvent, RawRecord};
pub use ids::EventId;
