pub mod backoff;
pub mod poller;
pub mod scheduler;
pub mod shutdown;
pub mod sweeper;

pub use backoff::BackoffPolicy;
pub use poller::{CycleSummary, Poller, PollerHealth, PollerState, PollerStatus};
pub use scheduler::BackgroundScheduler;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use sweeper::Sweeper;
