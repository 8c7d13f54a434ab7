//! Upstream ingestion: fetch, decode, normalize.

pub mod decoder;
pub mod identity;
pub mod normalizer;
pub mod upstream;

pub use decoder::Decoder;
pub use identity::{IdentityField, IdentityProjection};
pub use normalizer::{Normalizer, RequiredAttributes};
pub use upstream::{FeedPayload, FeedSource, UpstreamClient};
