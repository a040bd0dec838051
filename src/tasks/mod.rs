//! Long-running background tasks, stopped through the shutdown broadcast.

mod persister;
mod topology;

pub use persister::PersisterTask;
pub use topology::TopologyWatcherTask;
