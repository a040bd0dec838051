//! Queue identity and the cache key layout derived from it.
//!
//! Every key belonging to one device queue carries the queue name as its
//! hash tag, so the queue, its metadata and its persist lock share a slot.
//! The per-slot dirty index uses the minimal tag for that same slot.

use std::fmt;
use std::str::FromStr;

use redis::cluster_routing::get_slot;
use uuid::Uuid;

use crate::redis::slot::minimal_hash_tag;

pub const QUEUE_KEY_PREFIX: &str = "user_queue::";
pub const METADATA_KEY_PREFIX: &str = "user_queue_metadata::";
pub const PERSIST_LOCK_KEY_PREFIX: &str = "user_queue_persisting::";
pub const QUEUE_INDEX_KEY_PREFIX: &str = "user_queue_index::";
pub const PERSIST_SLOT_COUNTER_KEY: &str = "user_queue_persist_slot";

pub const KEYSPACE_PREFIX: &str = "__keyspace@0__:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueKeyError {
    #[error("queue name has no hash tag: {0}")]
    MissingHashTag(String),

    #[error("malformed queue name: {0}")]
    Malformed(String),
}

/// One device's queue: `(account, device)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub account_id: Uuid,
    pub device_id: u32,
}

impl QueueKey {
    pub fn new(account_id: Uuid, device_id: u32) -> Self {
        Self {
            account_id,
            device_id,
        }
    }

    /// `"{account}::{device}"`
    pub fn queue_name(&self) -> String {
        format!("{}::{}", self.account_id, self.device_id)
    }

    pub fn queue_key(&self) -> String {
        format!("{}{{{}}}", QUEUE_KEY_PREFIX, self.queue_name())
    }

    pub fn metadata_key(&self) -> String {
        format!("{}{{{}}}", METADATA_KEY_PREFIX, self.queue_name())
    }

    pub fn persist_lock_key(&self) -> String {
        format!("{}{{{}}}", PERSIST_LOCK_KEY_PREFIX, self.queue_name())
    }

    pub fn index_key(&self) -> String {
        queue_index_key(self.slot())
    }

    pub fn slot(&self) -> u16 {
        get_slot(self.queue_key().as_bytes())
    }

    /// Channel carrying queue mutations ("zadd" on insert)
    pub fn queue_channel(&self) -> String {
        format!("{}{}", KEYSPACE_PREFIX, self.queue_key())
    }

    /// Channel carrying persist lock changes ("del" on release)
    pub fn persist_lock_channel(&self) -> String {
        format!("{}{}", KEYSPACE_PREFIX, self.persist_lock_key())
    }

    pub fn channels(&self) -> Vec<String> {
        vec![self.queue_channel(), self.persist_lock_channel()]
    }

    /// Recover the queue from any key or channel embedding its hash tag.
    /// The tag is the text between the first `{` and the last `}`.
    pub fn from_tagged(tagged: &str) -> Result<Self, QueueKeyError> {
        let open = tagged.find('{');
        let close = tagged.rfind('}');
        match (open, close) {
            (Some(open), Some(close)) if open < close => tagged[open + 1..close].parse(),
            _ => Err(QueueKeyError::MissingHashTag(tagged.to_string())),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.account_id, self.device_id)
    }
}

impl FromStr for QueueKey {
    type Err = QueueKeyError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let (account, device) = name
            .split_once("::")
            .ok_or_else(|| QueueKeyError::Malformed(name.to_string()))?;
        let account_id =
            Uuid::parse_str(account).map_err(|_| QueueKeyError::Malformed(name.to_string()))?;
        let device_id = device
            .parse()
            .map_err(|_| QueueKeyError::Malformed(name.to_string()))?;
        Ok(Self::new(account_id, device_id))
    }
}

pub fn queue_index_key(slot: u16) -> String {
    format!("{}{{{}}}", QUEUE_INDEX_KEY_PREFIX, minimal_hash_tag(slot))
}
