//! Product persistence, upload staging and outbound webhook HTTP for prodimp.

use async_trait::async_trait;
use prodimp_core::{ProductRow, WebhookSubscription};
use thiserror::Error;

mod memory;
mod pg;
mod uploads;
mod webhook;

pub use memory::MemoryCatalog;
pub use pg::PgCatalog;
pub use uploads::{StoredUpload, UploadStore};
pub use webhook::{
    classify_reqwest_error, BackoffPolicy, DeliveryError, DeliveryOutcome, DeliveryReport,
    ProbeOutcome, ProbeResult, RetryDisposition, WebhookClient, WebhookClientConfig,
};

pub const CRATE_NAME: &str = "prodimp-storage";

/// Store failure, classified so callers can tell a bad row from a dead store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("unencodable value: {0}")]
    Encoding(String),
    #[error("store unreachable: {0}")]
    Connection(String),
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Constraint(_) => "constraint",
            StoreError::Encoding(_) => "encoding",
            StoreError::Connection(_) => "connection",
            StoreError::Other(_) => "other",
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

/// Maps a Postgres SQLSTATE onto a [`StoreError`] class.
pub fn classify_sqlstate(code: &str, message: String) -> StoreError {
    match code {
        // character_not_in_repertoire, untranslatable_character
        "22021" | "22P05" => StoreError::Encoding(message),
        c if c.starts_with("23") || c.starts_with("22") => StoreError::Constraint(message),
        c if c.starts_with("08") || c.starts_with("57P") => StoreError::Connection(message),
        _ => StoreError::Other(message),
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                classify_sqlstate(&code, message)
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(message),
            _ => StoreError::Other(message),
        }
    }
}

/// Upsert target keyed by the unique, lower-cased `sku`.
///
/// On conflict only `name` and `description` change; inserted rows are always
/// active regardless of [`ProductRow::is_active`].
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Writes every row in one transaction, all or nothing. Callers pass
    /// distinct skus; a repeated sku fails the whole statement.
    async fn upsert_batch(&self, rows: &[ProductRow]) -> Result<u64, StoreError>;

    async fn upsert_one(&self, row: &ProductRow) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SubscriberRegistry: Send + Sync {
    async fn active_subscriptions(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;
}
