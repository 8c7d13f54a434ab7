//! Durable mirror capability. Chosen once at start-up; `NoopDurableStore` stands in
//! when no backend is configured so the rest of the code never branches on it.

use futures::future::BoxFuture;

use crate::error::PersistenceError;
use crate::models::Event;

pub trait DurableStore: Send + Sync {
    /// Every persisted event, used once before serving.
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<Event>, PersistenceError>>;

    /// Upsert by id.
    fn upsert_many<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), PersistenceError>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDurableStore;

impl DurableStore for NoopDurableStore {
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<Event>, PersistenceError>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn upsert_many<'a>(&'a self, _events: &'a [Event]) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
