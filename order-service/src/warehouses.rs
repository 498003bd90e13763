use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use crate::clock::Clock;
use crate::error::OrderError;
use crate::store::{commit_or_rollback, LedgerTx, Store};

#[derive(Clone)]
pub struct WarehousesService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl WarehousesService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Inactive warehouses are skipped when reserving new orders; holds they
    /// already carry stay in force.
    pub async fn set_active(&self, warehouse_id: Uuid, active: bool) -> Result<(), OrderError> {
        let mut tx = self.store.begin().await?;
        let result = match tx.set_warehouse_active(warehouse_id, active).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(OrderError::WarehouseNotFound(warehouse_id)),
            Err(e) => Err(e.into()),
        };
        commit_or_rollback(tx, result).await?;

        info!("Warehouse {} active={}", warehouse_id, active);
        Ok(())
    }

    /// Moves on-hand stock between two warehouses. Only stock not held by an
    /// active reservation at the source can be moved.
    pub async fn transfer(&self, from: Uuid, to: Uuid, product_id: Uuid, quantity: i32) -> Result<(), OrderError> {
        if quantity < 1 {
            return Err(OrderError::validation("transfer quantity must be at least 1"));
        }
        if from == to {
            return Err(OrderError::validation("source and destination warehouse must differ"));
        }

        let mut tx = self.store.begin().await?;
        let result = self.transfer_in_tx(tx.as_mut(), from, to, product_id, quantity).await;
        commit_or_rollback(tx, result).await?;

        info!(%product_id, quantity, "Transferred stock from warehouse {} to {}", from, to);
        Ok(())
    }

    async fn transfer_in_tx(
        &self,
        tx: &mut dyn LedgerTx,
        from: Uuid,
        to: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), OrderError> {
        for warehouse_id in [from, to] {
            if !tx.warehouse_exists(warehouse_id).await? {
                return Err(OrderError::WarehouseNotFound(warehouse_id));
            }
        }

        let mut source_on_hand = 0;
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        for warehouse_id in [first, second] {
            let on_hand = tx.lock_inventory_row(warehouse_id, product_id).await?;
            if warehouse_id == from {
                source_on_hand = on_hand;
            }
        }

        let reserved = tx
            .sum_active_reservations(from, product_id, self.clock.now())
            .await?;
        if i64::from(source_on_hand) - reserved < i64::from(quantity) {
            return Err(OrderError::InsufficientStock { product_id, requested: quantity });
        }

        tx.adjust_inventory(from, product_id, -quantity).await?;
        tx.adjust_inventory(to, product_id, quantity).await?;
        Ok(())
    }
}
