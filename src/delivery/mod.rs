//! Lazy, paged delivery of a device queue.

mod pruner;
mod stream;

pub use pruner::StalePruner;
pub use stream::MessageStream;
