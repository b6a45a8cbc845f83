//! Core domain model and job-state types for the product importer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "prodimp-core";

/// Event name published to subscribers when an import finishes successfully.
pub const IMPORT_COMPLETED_EVENT: &str = "import.completed";

/// Event name used by the one-shot webhook probe.
pub const WEBHOOK_TEST_EVENT: &str = "webhook.test";

/// Normalized CSV record handed from the parser to the upsert engine.
///
/// `is_active` is the value the file asked for. Stores never apply it: new
/// skus are created active and existing skus keep their stored flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRow {
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
}

/// Persisted product row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: i64,
    pub url: String,
    pub event_type: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Denominator for progress reporting.
///
/// `Unknown` means the pre-scan failed and is never the same thing as a
/// verified `Counted(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RowTotal {
    Counting,
    Counted(u64),
    Unknown,
}

impl RowTotal {
    pub fn counted(&self) -> Option<u64> {
        match self {
            RowTotal::Counted(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub rows_processed: u64,
    pub rows_seen_valid: u64,
    pub total_rows: RowTotal,
    pub status: String,
}

/// Result of a successful import, also used as the webhook `data` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub job_id: Uuid,
    pub total_processed: u64,
    pub total_rows: RowTotal,
    pub skipped_rows: u64,
    pub malformed_rows: u64,
    pub failed_rows: u64,
    pub ignored_inactive_flags: u64,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running(Progress),
    Succeeded(ImportSummary),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already {0} and accepts no further updates")]
    Terminal(&'static str),
    #[error("cannot move a job from {from} to {to}")]
    Invalid {
        from: &'static str,
        to: &'static str,
    },
    #[error("rows_processed cannot go backwards ({previous} -> {next})")]
    Regression { previous: u64, next: u64 },
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running(_) => "running",
            JobState::Succeeded(_) => "succeeded",
            JobState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded(_) | JobState::Failed { .. })
    }

    /// Validates `pending -> running -> (succeeded | failed)`.
    pub fn check_transition(&self, next: &JobState) -> Result<(), TransitionError> {
        match (self, next) {
            (current, _) if current.is_terminal() => Err(TransitionError::Terminal(current.label())),
            (JobState::Pending, JobState::Running(_)) => Ok(()),
            (JobState::Running(prev), JobState::Running(p)) => {
                ensure_monotonic(prev.rows_processed, p.rows_processed)
            }
            (JobState::Running(prev), JobState::Succeeded(summary)) => {
                ensure_monotonic(prev.rows_processed, summary.total_processed)
            }
            (JobState::Running(_), JobState::Failed { .. }) => Ok(()),
            (current, next) => Err(TransitionError::Invalid {
                from: current.label(),
                to: next.label(),
            }),
        }
    }
}

fn ensure_monotonic(previous: u64, next: u64) -> Result<(), TransitionError> {
    if next < previous {
        Err(TransitionError::Regression { previous, next })
    } else {
        Ok(())
    }
}

/// Point-in-time view of a job as served to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn new(job_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outbound notification body: `{event, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn new(event: impl Into<String>, data: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp,
        }
    }

    pub fn import_completed(summary: &ImportSummary, timestamp: DateTime<Utc>) -> serde_json::Result<Self> {
        Ok(Self::new(
            IMPORT_COMPLETED_EVENT,
            serde_json::to_value(summary)?,
            timestamp,
        ))
    }
}

/// One queued delivery to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt {
    pub target_url: String,
    pub payload: WebhookPayload,
    pub attempt_count: u32,
}

impl DeliveryAttempt {
    pub fn new(target_url: impl Into<String>, payload: WebhookPayload) -> Self {
        Self {
            target_url: target_url.into(),
            payload,
            attempt_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap()
    }

    fn running(rows_processed: u64) -> JobState {
        JobState::Running(Progress {
            rows_processed,
            rows_seen_valid: rows_processed,
            total_rows: RowTotal::Counted(10),
            status: format!("Processed {rows_processed} products..."),
        })
    }

    fn summary(total_processed: u64) -> ImportSummary {
        ImportSummary {
            job_id: Uuid::nil(),
            total_processed,
            total_rows: RowTotal::Counted(total_processed),
            skipped_rows: 0,
            malformed_rows: 0,
            failed_rows: 0,
            ignored_inactive_flags: 0,
            message: format!("Successfully processed {total_processed} products"),
            started_at: ts(),
            finished_at: ts(),
            duration_ms: 0,
        }
    }

    #[test]
    fn linear_lifecycle_is_accepted() {
        assert!(JobState::Pending.check_transition(&running(0)).is_ok());
        assert!(running(0).check_transition(&running(5)).is_ok());
        assert!(running(5).check_transition(&running(5)).is_ok());
        assert!(running(5)
            .check_transition(&JobState::Succeeded(summary(5)))
            .is_ok());
        assert!(running(5)
            .check_transition(&JobState::Failed { error: "boom".into() })
            .is_ok());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let done = JobState::Succeeded(summary(3));
        assert_eq!(
            done.check_transition(&running(4)),
            Err(TransitionError::Terminal("succeeded"))
        );
        let failed = JobState::Failed { error: "x".into() };
        assert_eq!(
            failed.check_transition(&JobState::Succeeded(summary(1))),
            Err(TransitionError::Terminal("failed"))
        );
    }

    #[test]
    fn progress_never_regresses() {
        assert_eq!(
            running(7).check_transition(&running(6)),
            Err(TransitionError::Regression { previous: 7, next: 6 })
        );
        assert_eq!(
            running(7).check_transition(&JobState::Succeeded(summary(2))),
            Err(TransitionError::Regression { previous: 7, next: 2 })
        );
    }

    #[test]
    fn pending_must_start_running_first() {
        assert_eq!(
            JobState::Pending.check_transition(&JobState::Succeeded(summary(1))),
            Err(TransitionError::Invalid {
                from: "pending",
                to: "succeeded"
            })
        );
    }

    #[test]
    fn unknown_total_serializes_differently_from_zero() {
        let unknown = serde_json::to_value(RowTotal::Unknown).unwrap();
        let zero = serde_json::to_value(RowTotal::Counted(0)).unwrap();
        assert_ne!(unknown, zero);
        assert_eq!(zero, serde_json::json!({"kind": "counted", "value": 0}));
        assert_eq!(unknown, serde_json::json!({"kind": "unknown"}));
    }

    #[test]
    fn snapshot_flattens_state_tag() {
        let snapshot = JobSnapshot {
            job_id: Uuid::nil(),
            state: JobState::Failed {
                error: "CSV contained no valid rows".into(),
            },
            created_at: ts(),
            updated_at: ts(),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["error"], "CSV contained no valid rows");
    }

    #[test]
    fn import_completed_payload_shape() {
        let payload = WebhookPayload::import_completed(&summary(12), ts()).unwrap();
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["event"], IMPORT_COMPLETED_EVENT);
        assert_eq!(value["data"]["total_processed"], 12);
        assert_eq!(value["timestamp"], "2026-03-01T09:30:00Z");
    }
}
