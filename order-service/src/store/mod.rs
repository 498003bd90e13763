//! Transactional ledger store.
//!
//! Workflows open a [`LedgerTx`] through [`Store::begin`], issue their
//! statements against it and finish with [`commit_or_rollback`]. A
//! transaction that is dropped without committing leaves no trace.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{run_migrations, DbPool, PgStore, MIGRATIONS};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;
use crate::error::{OrderError, StoreResult};
use crate::models::*;

/// Statements issued inside one open transaction.
#[async_trait]
pub trait LedgerTx: Send {
    /// Order created by an earlier attempt with the same key and payload hash.
    async fn find_replayed_order(&mut self, key: &str, request_hash: &str) -> StoreResult<Option<Uuid>>;

    /// Returns `false` when the key already exists.
    async fn insert_idempotency_key(&mut self, key: &IdempotencyKey) -> StoreResult<bool>;

    async fn complete_idempotency_key(&mut self, key: &str, order_id: Uuid) -> StoreResult<()>;

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()>;

    async fn insert_order_item(&mut self, item: &OrderItem) -> StoreResult<()>;

    /// Active warehouses of a shop in ascending id order.
    async fn active_warehouses(&mut self, shop_id: Uuid) -> StoreResult<Vec<Uuid>>;

    async fn warehouse_exists(&mut self, warehouse_id: Uuid) -> StoreResult<bool>;

    /// Returns `false` when no such warehouse exists.
    async fn set_warehouse_active(&mut self, warehouse_id: Uuid, active: bool) -> StoreResult<bool>;

    /// Creates the inventory row at zero if absent, then takes its exclusive
    /// lock until the transaction ends and returns the on-hand quantity.
    /// Blocks while another transaction holds the same row.
    async fn lock_inventory_row(&mut self, warehouse_id: Uuid, product_id: Uuid) -> StoreResult<i32>;

    /// Only meaningful after [`LedgerTx::lock_inventory_row`] on the same pair.
    async fn sum_active_reservations(
        &mut self,
        warehouse_id: Uuid,
        product_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Inserts the reservation, or refreshes quantity and expiry of the one
    /// already held for the same (order, warehouse, product).
    async fn upsert_reservation(&mut self, reservation: &Reservation) -> StoreResult<()>;

    async fn adjust_inventory(&mut self, warehouse_id: Uuid, product_id: Uuid, delta: i32) -> StoreResult<()>;

    /// Reads the order status while locking the order row.
    async fn lock_order_status(&mut self, order_id: Uuid) -> StoreResult<Option<String>>;

    async fn active_reservations_for_order(
        &mut self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Reservation>>;

    async fn release_order_reservations(&mut self, order_id: Uuid) -> StoreResult<usize>;

    async fn mark_order_paid(&mut self, order_id: Uuid, now: DateTime<Utc>) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>>;

    /// Releases up to `limit` reservations that expired at or before `now`,
    /// oldest first, in a single statement.
    async fn release_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<usize>;

    /// On-hand minus active reservations, read without locking.
    async fn available(&self, warehouse_id: Uuid, product_id: Uuid, now: DateTime<Utc>) -> StoreResult<i64>;

    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<(Order, Vec<OrderItem>)>>;
}

/// Commits on success, rolls back on failure. A failed rollback is logged and
/// the workflow error is returned.
pub async fn commit_or_rollback<T>(
    tx: Box<dyn LedgerTx>,
    result: Result<T, OrderError>,
) -> Result<T, OrderError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed after {}: {}", e, rollback_err);
            }
            Err(e)
        }
    }
}
