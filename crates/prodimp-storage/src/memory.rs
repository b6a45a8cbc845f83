use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use prodimp_core::{Product, ProductRow, WebhookSubscription};
use tokio::sync::Mutex;

use crate::{ProductStore, StoreError, SubscriberRegistry};

const SKU_MAX_CHARS: usize = 255;
const NAME_MAX_CHARS: usize = 500;

/// In-process catalog mirroring the Postgres column rules.
///
/// Rejects what the `products` table would reject (over-long sku/name, NUL
/// characters, a sku repeated inside one statement) so fallback paths can be
/// exercised without a database.
#[derive(Debug)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    products: BTreeMap<String, Product>,
    webhooks: Vec<WebhookSubscription>,
    next_product_id: i64,
    available: bool,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                products: BTreeMap::new(),
                webhooks: Vec::new(),
                next_product_id: 1,
                available: true,
            }),
        }
    }

    /// Simulates the database going away (`false`) or coming back (`true`).
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Seeds a product directly, bypassing upsert rules (a manual edit).
    pub async fn insert_product(
        &self,
        sku: &str,
        name: &str,
        description: Option<&str>,
        is_active: bool,
    ) -> Product {
        let mut state = self.state.lock().await;
        let id = state.next_product_id;
        state.next_product_id += 1;
        let product = Product {
            id,
            sku: sku.to_string(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
            is_active,
        };
        state.products.insert(product.sku.clone(), product.clone());
        product
    }

    pub async fn set_active(&self, sku: &str, is_active: bool) -> bool {
        let mut state = self.state.lock().await;
        match state.products.get_mut(sku) {
            Some(product) => {
                product.is_active = is_active;
                true
            }
            None => false,
        }
    }

    pub async fn product(&self, sku: &str) -> Option<Product> {
        self.state.lock().await.products.get(sku).cloned()
    }

    pub async fn products(&self) -> Vec<Product> {
        self.state.lock().await.products.values().cloned().collect()
    }

    pub async fn product_count(&self) -> usize {
        self.state.lock().await.products.len()
    }

    pub async fn add_webhook(&self, url: &str, event_type: &str, is_active: bool) -> WebhookSubscription {
        let mut state = self.state.lock().await;
        let subscription = WebhookSubscription {
            id: state.webhooks.len() as i64 + 1,
            url: url.to_string(),
            event_type: event_type.to_string(),
            is_active,
            created_at: Utc::now(),
        };
        state.webhooks.push(subscription.clone());
        subscription
    }
}

impl MemoryState {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Connection("connection refused".into()))
        }
    }

    fn apply(&mut self, row: &ProductRow) {
        if let Some(existing) = self.products.get_mut(&row.sku) {
            existing.name = row.name.clone();
            existing.description = row.description.clone();
            return;
        }
        let id = self.next_product_id;
        self.next_product_id += 1;
        self.products.insert(
            row.sku.clone(),
            Product {
                id,
                sku: row.sku.clone(),
                name: row.name.clone(),
                description: row.description.clone(),
                is_active: true,
            },
        );
    }
}

fn check_row(row: &ProductRow) -> Result<(), StoreError> {
    let fields = [Some(row.sku.as_str()), Some(row.name.as_str()), row.description.as_deref()];
    if fields.iter().flatten().any(|f| f.contains('\0')) {
        return Err(StoreError::Encoding(
            "invalid byte sequence for encoding \"UTF8\": 0x00".into(),
        ));
    }
    if row.sku.chars().count() > SKU_MAX_CHARS {
        return Err(StoreError::Constraint(format!(
            "value too long for type character varying({SKU_MAX_CHARS})"
        )));
    }
    if row.name.chars().count() > NAME_MAX_CHARS {
        return Err(StoreError::Constraint(format!(
            "value too long for type character varying({NAME_MAX_CHARS})"
        )));
    }
    Ok(())
}

#[async_trait]
impl ProductStore for MemoryCatalog {
    async fn upsert_batch(&self, rows: &[ProductRow]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            check_row(row)?;
            if !seen.insert(row.sku.as_str()) {
                return Err(StoreError::Constraint(
                    "ON CONFLICT DO UPDATE command cannot affect row a second time".into(),
                ));
            }
        }
        for row in rows {
            state.apply(row);
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_one(&self, row: &ProductRow) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;
        check_row(row)?;
        state.apply(row);
        Ok(())
    }
}

#[async_trait]
impl SubscriberRegistry for MemoryCatalog {
    async fn active_subscriptions(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let state = self.state.lock().await;
        state.ensure_available()?;
        Ok(state
            .webhooks
            .iter()
            .filter(|w| w.is_active && w.event_type == event_type)
            .cloned()
            .collect())
    }
}
