//! Per-device envelope queues.
//!
//! Each `(account, device)` pair owns an ordered queue of encrypted
//! envelopes, addressed by store-assigned sequence numbers. Writes mark
//! the queue dirty in its slot's index so the persister can find it.
//!
//! - `QueueStore`: the store contract
//! - `RedisQueueStore`: Lua-scripted Redis / Redis Cluster store
//! - `MemoryQueueStore`: single-process store with local keyspace events

mod envelope;
mod factory;
pub mod key;
mod memory_store;
mod redis_store;
mod store;

pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeCodecError};
pub use factory::{create_cache_backends, memory_backends, CacheBackends};
pub use key::{QueueKey, QueueKeyError, KEYSPACE_PREFIX};
pub use memory_store::MemoryQueueStore;
pub use redis_store::RedisQueueStore;
pub use store::{Page, QueueStore, QueueStoreConfig, QueueStoreError};
