pub mod events;
pub mod health;

pub use events::{get_event, list_events};
pub use health::health_check;
