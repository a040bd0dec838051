//! PostgreSQL-backed durable message store.
//!
//! Table structure:
//! - `persisted_messages`: one row per envelope, keyed by
//!   `(account_id, device_id, server_guid)` so re-persisting is a no-op

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};

use crate::postgres::PostgresPool;
use crate::queue::{Envelope, QueueKey};

use super::durable::{DurableMessageStore, DurableStoreError};

/// Rows per INSERT, well under the bind parameter limit.
const INSERT_CHUNK: usize = 1000;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS persisted_messages (
    account_id UUID NOT NULL,
    device_id BIGINT NOT NULL,
    server_guid UUID NOT NULL,
    timestamp BIGINT NOT NULL,
    server_timestamp BIGINT NOT NULL,
    source_service_id TEXT,
    source_device BIGINT,
    destination_service_id TEXT,
    ephemeral BOOLEAN NOT NULL DEFAULT FALSE,
    urgent BOOLEAN NOT NULL DEFAULT FALSE,
    story BOOLEAN NOT NULL DEFAULT FALSE,
    report_spam_token BYTEA,
    content BYTEA NOT NULL,
    persisted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (account_id, device_id, server_guid)
)
"#;

pub struct PostgresMessageStore {
    pool: PostgresPool,
}

impl PostgresMessageStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), DurableStoreError> {
        self.pool
            .execute(|pool| async move { sqlx::query(CREATE_TABLE).execute(&pool).await })
            .await?;
        tracing::info!(url = %self.pool.database_url_masked(), "Durable message schema ready");
        Ok(())
    }
}

fn insert_query<'a>(key: &QueueKey, envelopes: &'a [Envelope]) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(
        "INSERT INTO persisted_messages (account_id, device_id, server_guid, timestamp, \
         server_timestamp, source_service_id, source_device, destination_service_id, \
         ephemeral, urgent, story, report_spam_token, content) ",
    );

    let account_id = key.account_id;
    let device_id = key.device_id as i64;
    builder.push_values(envelopes, |mut row, envelope| {
        row.push_bind(account_id)
            .push_bind(device_id)
            .push_bind(envelope.server_guid)
            .push_bind(envelope.timestamp)
            .push_bind(envelope.server_timestamp)
            .push_bind(envelope.source_service_id.as_deref())
            .push_bind(envelope.source_device.map(i64::from))
            .push_bind(envelope.destination_service_id.as_deref())
            .push_bind(envelope.ephemeral)
            .push_bind(envelope.urgent)
            .push_bind(envelope.story)
            .push_bind(envelope.report_spam_token.as_deref())
            .push_bind(envelope.content.as_slice());
    });
    builder.push(" ON CONFLICT (account_id, device_id, server_guid) DO NOTHING");
    builder
}

#[async_trait]
impl DurableMessageStore for PostgresMessageStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[tracing::instrument(skip(self, envelopes), fields(queue = %key, count = envelopes.len()))]
    async fn persist(&self, key: &QueueKey, envelopes: &[Envelope]) -> Result<usize, DurableStoreError> {
        let mut added = 0u64;

        for chunk in envelopes.chunks(INSERT_CHUNK) {
            let result = self
                .pool
                .execute(|pool| async move {
                    let mut query = insert_query(key, chunk);
                    query.build().execute(&pool).await
                })
                .await?;
            added += result.rows_affected();
        }

        Ok(added as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_insert_query_shape() {
        let key = QueueKey::new(Uuid::new_v4(), 2);
        let envelopes = vec![
            Envelope::builder(Uuid::new_v4()).content("a").build(),
            Envelope::builder(Uuid::new_v4()).content("b").build(),
        ];

        let query = insert_query(&key, &envelopes);
        let sql = query.sql();

        assert!(sql.starts_with("INSERT INTO persisted_messages"));
        assert!(sql.contains("$26"));
        assert!(!sql.contains("$27"));
        assert!(sql.ends_with("DO NOTHING"));
    }
}
