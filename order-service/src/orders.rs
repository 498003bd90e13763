//! Order reservation and payment workflows.
//!
//! Creating an order reserves every line item in full from exactly one
//! warehouse, or nothing at all. Inventory is debited only when the order is
//! paid; unpaid reservations lapse at their expiry and are swept later.
//!
//! Warehouse selection is greedy: for each item the first active warehouse of
//! the shop (ascending id) whose availability covers the whole quantity wins.
//! There is no backtracking across items and no best-fit packing. Items are
//! visited in ascending product id, so every transaction takes inventory row
//! locks in ascending (product, warehouse) order.

use chrono::Duration;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use shared::{request_hash, OrderDetails, OrderItemRequest, OrderItemView, OrderStatus};
use crate::clock::Clock;
use crate::error::{OrderError, StoreError, StoreResult};
use crate::models::*;
use crate::store::{commit_or_rollback, LedgerTx, Store};

enum CreateOutcome {
    Created(Uuid),
    Replayed(Uuid),
}

#[derive(Clone)]
pub struct OrdersService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    reservation_ttl: Duration,
}

impl OrdersService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, reservation_ttl: Duration) -> Self {
        Self { store, clock, reservation_ttl }
    }

    /// Creates an order in `reserved` state and holds stock for every item
    /// until `now + reservation_ttl`.
    ///
    /// A retry carrying the same idempotency key and byte-identical body
    /// returns the first attempt's order id without touching the ledger again.
    pub async fn create(
        &self,
        idempotency_key: &str,
        raw_body: &[u8],
        shop_id: Uuid,
        items: &[OrderItemRequest],
    ) -> Result<Uuid, OrderError> {
        validate_create(idempotency_key, items)?;

        let request_hash = request_hash(raw_body);
        let mut lines = items.to_vec();
        lines.sort_by_key(|line| line.product_id);

        let mut tx = self.store.begin().await?;
        let result = self
            .reserve_in_tx(tx.as_mut(), idempotency_key, &request_hash, shop_id, &lines)
            .await;

        match commit_or_rollback(tx, result).await? {
            CreateOutcome::Created(order_id) => {
                info!(%shop_id, items = lines.len(), "Order {} reserved", order_id);
                Ok(order_id)
            }
            CreateOutcome::Replayed(order_id) => {
                info!("Idempotency key {:?} replayed, returning order {}", idempotency_key, order_id);
                Ok(order_id)
            }
        }
    }

    async fn reserve_in_tx(
        &self,
        tx: &mut dyn LedgerTx,
        idempotency_key: &str,
        request_hash: &str,
        shop_id: Uuid,
        lines: &[OrderItemRequest],
    ) -> Result<CreateOutcome, OrderError> {
        if let Some(order_id) = tx.find_replayed_order(idempotency_key, request_hash).await? {
            return Ok(CreateOutcome::Replayed(order_id));
        }

        let now = self.clock.now();
        let user_id = Uuid::new_v4();
        let key_row = IdempotencyKey {
            key: idempotency_key.to_string(),
            user_id,
            request_hash: request_hash.to_string(),
            order_id: None,
            created_at: now,
        };
        if !tx.insert_idempotency_key(&key_row).await? {
            // An identical attempt may have committed while this one waited on the key.
            return match tx.find_replayed_order(idempotency_key, request_hash).await? {
                Some(order_id) => Ok(CreateOutcome::Replayed(order_id)),
                None => Err(OrderError::IdempotencyConflict(idempotency_key.to_string())),
            };
        }

        let order_id = Uuid::new_v4();
        tx.insert_order(&Order {
            id: order_id,
            user_id,
            shop_id,
            status: OrderStatus::Reserved.to_string(),
            created_at: now,
            updated_at: now,
        })
        .await?;

        let candidates = tx.active_warehouses(shop_id).await?;
        let expires_at = now + self.reservation_ttl;

        for line in lines {
            tx.insert_order_item(&OrderItem {
                order_id,
                product_id: line.product_id,
                quantity: line.quantity,
            })
            .await?;

            let warehouse_id = first_with_stock(tx, &candidates, line, now)
                .await?
                .ok_or(OrderError::InsufficientStock {
                    product_id: line.product_id,
                    requested: line.quantity,
                })?;

            tx.upsert_reservation(&Reservation {
                id: Uuid::new_v4(),
                order_id,
                warehouse_id,
                product_id: line.product_id,
                quantity: line.quantity,
                expires_at,
                released: false,
                created_at: now,
            })
            .await?;
        }

        tx.complete_idempotency_key(idempotency_key, order_id).await?;
        Ok(CreateOutcome::Created(order_id))
    }

    /// Turns the order's active reservations into permanent inventory debits
    /// and marks it paid. Fails without side effects unless the order is
    /// `reserved`.
    pub async fn pay(&self, order_id: Uuid) -> Result<(), OrderError> {
        let mut tx = self.store.begin().await?;
        let result = self.pay_in_tx(tx.as_mut(), order_id).await;
        let debited = commit_or_rollback(tx, result).await?;

        info!(debited, "Order {} paid", order_id);
        Ok(())
    }

    async fn pay_in_tx(&self, tx: &mut dyn LedgerTx, order_id: Uuid) -> Result<usize, OrderError> {
        let status = tx
            .lock_order_status(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))?;
        if status != OrderStatus::Reserved.as_str() {
            return Err(OrderError::InvalidOrderState { order_id, status });
        }

        let now = self.clock.now();
        let mut held = tx.active_reservations_for_order(order_id, now).await?;
        held.sort_by_key(|r| (r.product_id, r.warehouse_id));

        // Holds that lapsed before payment are not debited.
        if held.is_empty() {
            warn!("Order {} has no active reservations left, nothing to debit", order_id);
        }
        for reservation in &held {
            tx.adjust_inventory(reservation.warehouse_id, reservation.product_id, -reservation.quantity)
                .await?;
        }

        tx.release_order_reservations(order_id).await?;
        tx.mark_order_paid(order_id, now).await?;
        Ok(held.len())
    }

    /// Releases up to `limit` expired, unreleased reservations.
    pub async fn sweep_expired(&self, limit: i64) -> Result<usize, OrderError> {
        if limit < 1 {
            return Err(OrderError::validation("sweep limit must be at least 1"));
        }
        let released = self.store.release_expired(self.clock.now(), limit).await?;
        Ok(released)
    }

    pub async fn order(&self, order_id: Uuid) -> Result<OrderDetails, OrderError> {
        let (order, items) = self
            .store
            .find_order(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))?;
        let status = order
            .status
            .parse::<OrderStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(OrderDetails {
            id: order.id,
            shop_id: order.shop_id,
            status,
            items: items
                .into_iter()
                .map(|item| OrderItemView { product_id: item.product_id, quantity: item.quantity })
                .collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        })
    }

    /// On-hand quantity minus active reservations for one warehouse/product.
    pub async fn availability(&self, warehouse_id: Uuid, product_id: Uuid) -> Result<i64, OrderError> {
        let available = self
            .store
            .available(warehouse_id, product_id, self.clock.now())
            .await?;
        Ok(available)
    }
}

/// Locks each candidate's inventory row in turn and returns the first whose
/// availability covers the whole line.
async fn first_with_stock(
    tx: &mut dyn LedgerTx,
    candidates: &[Uuid],
    line: &OrderItemRequest,
    now: chrono::DateTime<chrono::Utc>,
) -> StoreResult<Option<Uuid>> {
    for &warehouse_id in candidates {
        let on_hand = tx.lock_inventory_row(warehouse_id, line.product_id).await?;
        let reserved = tx.sum_active_reservations(warehouse_id, line.product_id, now).await?;
        if i64::from(on_hand) - reserved >= i64::from(line.quantity) {
            return Ok(Some(warehouse_id));
        }
    }
    Ok(None)
}

fn validate_create(idempotency_key: &str, items: &[OrderItemRequest]) -> Result<(), OrderError> {
    if idempotency_key.trim().is_empty() {
        return Err(OrderError::validation("idempotency key must not be empty"));
    }
    if items.is_empty() {
        return Err(OrderError::validation("order must contain at least one item"));
    }

    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if item.quantity < 1 {
            return Err(OrderError::validation(format!(
                "quantity for product {} must be at least 1",
                item.product_id
            )));
        }
        if !seen.insert(item.product_id) {
            return Err(OrderError::validation(format!(
                "product {} appears more than once",
                item.product_id
            )));
        }
    }
    Ok(())
}
