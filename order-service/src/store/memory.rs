use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;
use crate::error::{StoreError, StoreResult};
use crate::models::*;
use super::{LedgerTx, Store};

#[derive(Debug, Clone, Default)]
struct Ledger {
    warehouses: BTreeMap<Uuid, Warehouse>,
    inventory: BTreeMap<(Uuid, Uuid), i32>,
    orders: HashMap<Uuid, Order>,
    order_items: Vec<OrderItem>,
    reservations: Vec<Reservation>,
    idempotency_keys: HashMap<String, IdempotencyKey>,
}

impl Ledger {
    fn sum_active(&self, warehouse_id: Uuid, product_id: Uuid, now: DateTime<Utc>) -> i64 {
        self.reservations
            .iter()
            .filter(|r| r.warehouse_id == warehouse_id && r.product_id == product_id && r.is_active(now))
            .map(|r| i64::from(r.quantity))
            .sum()
    }
}

fn unique_violation(what: String) -> StoreError {
    StoreError::Database(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, Box::new(what)))
}

fn out_of_range(what: String) -> StoreError {
    StoreError::Database(DieselError::DatabaseError(DatabaseErrorKind::Unknown, Box::new(what)))
}

/// In-process ledger for tests and local development.
///
/// A transaction holds the whole ledger for its lifetime, which is a strictly
/// stronger guarantee than per-row locks. Writes go to a working copy that
/// replaces the ledger on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    ledger: Arc<Mutex<Ledger>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_warehouse(&self, shop_id: Uuid, active: bool) -> Uuid {
        let id = Uuid::new_v4();
        let warehouse = Warehouse {
            id,
            shop_id,
            name: format!("warehouse-{}", id.simple()),
            active,
            created_at: Utc::now(),
        };
        self.ledger.lock().await.warehouses.insert(id, warehouse);
        id
    }

    pub async fn set_stock(&self, warehouse_id: Uuid, product_id: Uuid, quantity: i32) {
        self.ledger.lock().await.inventory.insert((warehouse_id, product_id), quantity);
    }

    pub async fn on_hand(&self, warehouse_id: Uuid, product_id: Uuid) -> Option<i32> {
        self.ledger.lock().await.inventory.get(&(warehouse_id, product_id)).copied()
    }

    pub async fn reservations(&self) -> Vec<Reservation> {
        self.ledger.lock().await.reservations.clone()
    }

    pub async fn idempotency_key(&self, key: &str) -> Option<IdempotencyKey> {
        self.ledger.lock().await.idempotency_keys.get(key).cloned()
    }

    pub async fn order_count(&self) -> usize {
        self.ledger.lock().await.orders.len()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Ledger>,
    working: Ledger,
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let guard = self.ledger.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn release_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<usize> {
        let mut ledger = self.ledger.lock().await;
        let mut expired: Vec<usize> = ledger
            .reservations
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.released && r.expires_at <= now)
            .map(|(idx, _)| idx)
            .collect();
        expired.sort_by_key(|&idx| ledger.reservations[idx].expires_at);
        expired.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));

        for &idx in &expired {
            ledger.reservations[idx].released = true;
        }
        Ok(expired.len())
    }

    async fn available(&self, warehouse_id: Uuid, product_id: Uuid, now: DateTime<Utc>) -> StoreResult<i64> {
        let ledger = self.ledger.lock().await;
        let on_hand = ledger.inventory.get(&(warehouse_id, product_id)).copied().unwrap_or(0);
        Ok(i64::from(on_hand) - ledger.sum_active(warehouse_id, product_id, now))
    }

    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<(Order, Vec<OrderItem>)>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.orders.get(&order_id).map(|order| {
            let items = ledger
                .order_items
                .iter()
                .filter(|item| item.order_id == order_id)
                .cloned()
                .collect();
            (order.clone(), items)
        }))
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn find_replayed_order(&mut self, key: &str, request_hash: &str) -> StoreResult<Option<Uuid>> {
        Ok(self
            .working
            .idempotency_keys
            .get(key)
            .filter(|k| k.request_hash == request_hash)
            .and_then(|k| k.order_id))
    }

    async fn insert_idempotency_key(&mut self, key: &IdempotencyKey) -> StoreResult<bool> {
        if self.working.idempotency_keys.contains_key(&key.key) {
            return Ok(false);
        }
        self.working.idempotency_keys.insert(key.key.clone(), key.clone());
        Ok(true)
    }

    async fn complete_idempotency_key(&mut self, key: &str, order_id: Uuid) -> StoreResult<()> {
        if let Some(row) = self.working.idempotency_keys.get_mut(key) {
            row.order_id = Some(order_id);
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        if self.working.orders.contains_key(&order.id) {
            return Err(unique_violation(format!("order {} already exists", order.id)));
        }
        self.working.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn insert_order_item(&mut self, item: &OrderItem) -> StoreResult<()> {
        let duplicate = self
            .working
            .order_items
            .iter()
            .any(|existing| existing.order_id == item.order_id && existing.product_id == item.product_id);
        if duplicate {
            return Err(unique_violation(format!(
                "order item ({}, {}) already exists",
                item.order_id, item.product_id
            )));
        }
        self.working.order_items.push(item.clone());
        Ok(())
    }

    async fn active_warehouses(&mut self, shop_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .working
            .warehouses
            .values()
            .filter(|w| w.shop_id == shop_id && w.active)
            .map(|w| w.id)
            .collect())
    }

    async fn warehouse_exists(&mut self, warehouse_id: Uuid) -> StoreResult<bool> {
        Ok(self.working.warehouses.contains_key(&warehouse_id))
    }

    async fn set_warehouse_active(&mut self, warehouse_id: Uuid, active: bool) -> StoreResult<bool> {
        match self.working.warehouses.get_mut(&warehouse_id) {
            Some(warehouse) => {
                warehouse.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn lock_inventory_row(&mut self, warehouse_id: Uuid, product_id: Uuid) -> StoreResult<i32> {
        Ok(*self.working.inventory.entry((warehouse_id, product_id)).or_insert(0))
    }

    async fn sum_active_reservations(
        &mut self,
        warehouse_id: Uuid,
        product_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        Ok(self.working.sum_active(warehouse_id, product_id, now))
    }

    async fn upsert_reservation(&mut self, reservation: &Reservation) -> StoreResult<()> {
        let existing = self.working.reservations.iter_mut().find(|r| {
            r.order_id == reservation.order_id
                && r.warehouse_id == reservation.warehouse_id
                && r.product_id == reservation.product_id
        });
        match existing {
            Some(row) => {
                row.quantity = reservation.quantity;
                row.expires_at = reservation.expires_at;
                row.released = false;
            }
            None => self.working.reservations.push(reservation.clone()),
        }
        Ok(())
    }

    async fn adjust_inventory(&mut self, warehouse_id: Uuid, product_id: Uuid, delta: i32) -> StoreResult<()> {
        if let Some(quantity) = self.working.inventory.get_mut(&(warehouse_id, product_id)) {
            *quantity = quantity
                .checked_add(delta)
                .ok_or_else(|| out_of_range(format!("integer out of range: inventory ({warehouse_id}, {product_id})")))?;
        }
        Ok(())
    }

    async fn lock_order_status(&mut self, order_id: Uuid) -> StoreResult<Option<String>> {
        Ok(self.working.orders.get(&order_id).map(|o| o.status.clone()))
    }

    async fn active_reservations_for_order(
        &mut self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Reservation>> {
        Ok(self
            .working
            .reservations
            .iter()
            .filter(|r| r.order_id == order_id && r.is_active(now))
            .cloned()
            .collect())
    }

    async fn release_order_reservations(&mut self, order_id: Uuid) -> StoreResult<usize> {
        let mut released = 0;
        for reservation in self.working.reservations.iter_mut().filter(|r| r.order_id == order_id) {
            reservation.released = true;
            released += 1;
        }
        Ok(released)
    }

    async fn mark_order_paid(&mut self, order_id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        if let Some(order) = self.working.orders.get_mut(&order_id) {
            order.status = shared::OrderStatus::Paid.to_string();
            order.updated_at = now;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
