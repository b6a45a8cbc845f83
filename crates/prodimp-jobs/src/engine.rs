use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use prodimp_core::ProductRow;
use prodimp_storage::{ProductStore, StoreError};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 3000;
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Consecutive connection failures in per-row fallback before the rest of a
/// window is written off without further store calls.
pub const MAX_CONSECUTIVE_CONNECTION_FAILURES: u32 = 3;

/// What happened to one window of rows.
///
/// Counts are in input rows: a sku repeated three times in the window counts
/// three times in `written` or `failed` even though it is stored once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowOutcome {
    pub rows_in: u64,
    pub written: u64,
    pub failed: u64,
    pub collapsed_duplicates: u64,
    /// The batch write failed and rows went through one at a time.
    pub degraded: bool,
}

/// Writes parsed rows to a [`ProductStore`] in bounded windows.
#[derive(Clone)]
pub struct BatchUpsertEngine {
    store: Arc<dyn ProductStore>,
    batch_size: usize,
}

impl BatchUpsertEngine {
    pub fn new(store: Arc<dyn ProductStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn apply_window(&self, window: &[ProductRow]) -> WindowOutcome {
        let started = Instant::now();
        let (unique, weights) = collapse_last_wins(window);
        let rows_in = window.len() as u64;
        let mut outcome = WindowOutcome {
            rows_in,
            collapsed_duplicates: rows_in - unique.len() as u64,
            ..WindowOutcome::default()
        };
        if unique.is_empty() {
            return outcome;
        }

        match self.store.upsert_batch(&unique).await {
            Ok(_) => outcome.written = rows_in,
            Err(err) => {
                warn!(
                    rows = unique.len(),
                    kind = err.kind(),
                    error = %err,
                    "batch upsert failed; retrying rows individually"
                );
                outcome.degraded = true;
                let (written, failed) = self.apply_individually(&unique, &weights).await;
                outcome.written = written;
                outcome.failed = failed;
            }
        }

        let elapsed = started.elapsed();
        let rows_per_sec = if elapsed.as_secs_f64() > 0.0 {
            outcome.written as f64 / elapsed.as_secs_f64()
        } else {
            outcome.written as f64
        };
        info!(
            rows = rows_in,
            written = outcome.written,
            failed = outcome.failed,
            collapsed = outcome.collapsed_duplicates,
            degraded = outcome.degraded,
            elapsed_ms = elapsed.as_millis() as u64,
            rows_per_sec = rows_per_sec.round() as u64,
            "window committed"
        );
        outcome
    }

    async fn apply_individually(&self, rows: &[ProductRow], weights: &[u64]) -> (u64, u64) {
        let mut written = 0;
        let mut failed = 0;
        let mut connection_failures = 0u32;

        for (idx, (row, weight)) in rows.iter().zip(weights).enumerate() {
            match self.store.upsert_one(row).await {
                Ok(()) => {
                    connection_failures = 0;
                    written += weight;
                }
                Err(err) => {
                    failed += weight;
                    log_row_failure(row, &err);
                    if !err.is_connection() {
                        connection_failures = 0;
                        continue;
                    }
                    connection_failures += 1;
                    if connection_failures >= MAX_CONSECUTIVE_CONNECTION_FAILURES {
                        let abandoned: u64 = weights[idx + 1..].iter().sum();
                        error!(
                            abandoned,
                            "store unreachable; abandoning remaining rows in window"
                        );
                        failed += abandoned;
                        break;
                    }
                }
            }
        }
        (written, failed)
    }
}

fn log_row_failure(row: &ProductRow, err: &StoreError) {
    if err.is_connection() {
        warn!(sku = %row.sku, error = %err, "row write failed: store unreachable");
    } else {
        debug!(sku = %row.sku, kind = err.kind(), error = %err, "row rejected");
    }
}

/// Collapses repeated skus so a single statement never touches a row twice.
///
/// Keeps the position of the first occurrence and the values of the last;
/// `weights[i]` is how many input rows `unique[i]` stands for.
fn collapse_last_wins(window: &[ProductRow]) -> (Vec<ProductRow>, Vec<u64>) {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(window.len());
    let mut unique: Vec<ProductRow> = Vec::with_capacity(window.len());
    let mut weights: Vec<u64> = Vec::with_capacity(window.len());
    for row in window {
        match index.get(row.sku.as_str()) {
            Some(&pos) => {
                unique[pos] = row.clone();
                weights[pos] += 1;
            }
            None => {
                index.insert(row.sku.as_str(), unique.len());
                unique.push(row.clone());
                weights.push(1);
            }
        }
    }
    (unique, weights)
}
