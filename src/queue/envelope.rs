//! Queued envelope and its stored encoding.
//!
//! Envelopes are stored as CBOR. Only the control fields are interpreted;
//! `content` is end-to-end encrypted and passed through untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeCodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

impl From<ciborium::ser::Error<std::io::Error>> for EnvelopeCodecError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        EnvelopeCodecError::Encode(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for EnvelopeCodecError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        EnvelopeCodecError::Decode(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Server-assigned identifier, the unit of deduplication and deletion
    pub server_guid: Uuid,
    /// Sender clock, milliseconds since epoch
    pub timestamp: i64,
    /// Server acceptance time, milliseconds since epoch
    pub server_timestamp: i64,
    /// Absent for sealed-sender envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_service_id: Option<String>,
    /// Online-only: worthless once older than the ephemeral delay
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub story: bool,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub report_spam_token: Option<Vec<u8>>,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl Envelope {
    pub fn builder(server_guid: Uuid) -> EnvelopeBuilder {
        EnvelopeBuilder::new(server_guid)
    }

    pub fn source_is_sealed(&self) -> bool {
        self.source_service_id.is_none()
    }

    /// An ephemeral envelope is stale once its sender timestamp is at
    /// least `max_delay` in the past.
    pub fn is_stale_ephemeral(&self, now_ms: i64, max_delay: Duration) -> bool {
        self.ephemeral && self.timestamp <= now_ms - max_delay.as_millis() as i64
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeCodecError> {
        let mut bytes = Vec::with_capacity(self.content.len() + 96);
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeCodecError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    pub fn new(server_guid: Uuid) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            envelope: Envelope {
                server_guid,
                timestamp: now,
                server_timestamp: now,
                source_service_id: None,
                source_device: None,
                destination_service_id: None,
                ephemeral: false,
                urgent: false,
                story: false,
                report_spam_token: None,
                content: Vec::new(),
            },
        }
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.envelope.timestamp = timestamp;
        self
    }

    pub fn server_timestamp(mut self, server_timestamp: i64) -> Self {
        self.envelope.server_timestamp = server_timestamp;
        self
    }

    pub fn source(mut self, service_id: impl Into<String>, device: u32) -> Self {
        self.envelope.source_service_id = Some(service_id.into());
        self.envelope.source_device = Some(device);
        self
    }

    pub fn destination(mut self, service_id: impl Into<String>) -> Self {
        self.envelope.destination_service_id = Some(service_id.into());
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.envelope.ephemeral = ephemeral;
        self
    }

    pub fn urgent(mut self, urgent: bool) -> Self {
        self.envelope.urgent = urgent;
        self
    }

    pub fn story(mut self, story: bool) -> Self {
        self.envelope.story = story;
        self
    }

    pub fn report_spam_token(mut self, token: Vec<u8>) -> Self {
        self.envelope.report_spam_token = Some(token);
        self
    }

    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.envelope.content = content.into();
        self
    }

    pub fn build(self) -> Envelope {
        self.envelope
    }
}
