use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prodimp_core::{ProductRow, WebhookSubscription};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::{ProductStore, StoreError, SubscriberRegistry};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id BIGSERIAL PRIMARY KEY,
    sku VARCHAR(255) NOT NULL UNIQUE,
    name VARCHAR(500) NOT NULL,
    description TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE INDEX IF NOT EXISTS idx_sku_active ON products (sku, is_active);
CREATE INDEX IF NOT EXISTS idx_name_active ON products (name, is_active);

CREATE TABLE IF NOT EXISTS webhooks (
    id BIGSERIAL PRIMARY KEY,
    url VARCHAR(2048) NOT NULL,
    event_type VARCHAR(100) NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_webhooks_event_active ON webhooks (event_type, is_active);
"#;

// `is_active` is deliberately absent from the update list.
const UPSERT_CONFLICT_CLAUSE: &str = " ON CONFLICT (sku) DO UPDATE SET \
     name = EXCLUDED.name, \
     description = EXCLUDED.description";

/// Postgres-backed catalog: `products` upsert target + `webhooks` registry.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates tables and indexes when missing. Not a migration system.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        info!("products/webhooks schema ensured");
        Ok(())
    }

    fn upsert_query<'a>(rows: &'a [ProductRow]) -> QueryBuilder<'a, Postgres> {
        let mut qb = QueryBuilder::new("INSERT INTO products (sku, name, description, is_active) ");
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.sku.as_str())
                .push_bind(row.name.as_str())
                .push_bind(row.description.as_deref())
                .push_bind(true);
        });
        qb.push(UPSERT_CONFLICT_CLAUSE);
        qb
    }
}

#[async_trait]
impl ProductStore for PgCatalog {
    async fn upsert_batch(&self, rows: &[ProductRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let result = Self::upsert_query(rows).build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn upsert_one(&self, row: &ProductRow) -> Result<(), StoreError> {
        Self::upsert_query(std::slice::from_ref(row))
            .build()
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriberRegistry for PgCatalog {
    async fn active_subscriptions(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, event_type, is_active, created_at
              FROM webhooks
             WHERE event_type = $1
               AND is_active = TRUE
             ORDER BY id
            "#,
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            out.push(WebhookSubscription {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                event_type: row.try_get("event_type")?,
                is_active: row.try_get("is_active")?,
                created_at,
            });
        }
        Ok(out)
    }
}
