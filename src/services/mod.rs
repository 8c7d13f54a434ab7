pub mod durable;
pub mod elastic;
pub mod event_store;
pub mod reconciliation;

pub use durable::{DurableStore, NoopDurableStore};
pub use elastic::ElasticStore;
pub use event_store::{EventStore, SweepReport};
pub use reconciliation::Reconciler;
