//! Historical replay, live delivery and the gap-repair timer.

mod historical;
mod live;
mod scheduler;

pub use historical::{HistoricalSyncConfig, HistoricalSyncEngine, SkippedGap, SyncOutcome};
pub use live::{LiveExit, LiveSubscriber};
pub use scheduler::PeriodicScheduler;
