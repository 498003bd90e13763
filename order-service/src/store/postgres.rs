use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{exists, sum};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamptz};
use diesel::upsert::excluded;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;
use uuid::Uuid;
use shared::OrderStatus;
use crate::error::{StoreError, StoreResult};
use crate::models::*;
use crate::schema::*;
use super::{LedgerTx, Store};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConn = bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

type Txm = AnsiTransactionManager;

/// Releases the oldest expired holds first. `SKIP LOCKED` keeps a sweep from
/// queueing behind a payment that is releasing the same rows.
const RELEASE_EXPIRED_SQL: &str = "\
    UPDATE reservations SET released = TRUE \
    WHERE id IN ( \
        SELECT id FROM reservations \
        WHERE released = FALSE AND expires_at <= $1 \
        ORDER BY expires_at \
        LIMIT $2 \
        FOR UPDATE SKIP LOCKED \
    )";

/// Applies pending embedded migrations over a short-lived blocking connection.
pub fn run_migrations(database_url: &str) -> StoreResult<()> {
    let mut conn = diesel::PgConnection::establish(database_url)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    info!("Applied {} pending migrations", applied.len());
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_connections)
            .build(config)
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<PooledConn> {
        self.pool
            .get_owned()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

/// An open read-committed transaction on a pooled connection.
///
/// Dropping it without `commit`/`rollback` returns the connection with an
/// open transaction, which the pool treats as broken and closes, so the
/// server rolls the work back.
pub struct PgLedgerTx {
    conn: PooledConn,
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let mut conn = self.conn().await?;
        <Txm as TransactionManager<AsyncPgConnection>>::begin_transaction(&mut *conn).await?;
        diesel::sql_query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *conn)
            .await?;
        Ok(Box::new(PgLedgerTx { conn }))
    }

    async fn release_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<usize> {
        let mut conn = self.conn().await?;
        let released = diesel::sql_query(RELEASE_EXPIRED_SQL)
            .bind::<Timestamptz, _>(now)
            .bind::<BigInt, _>(limit)
            .execute(&mut *conn)
            .await?;
        Ok(released)
    }

    async fn available(&self, warehouse_id: Uuid, product_id: Uuid, now: DateTime<Utc>) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let on_hand = inventory::table
            .find((warehouse_id, product_id))
            .select(inventory::quantity)
            .get_result::<i32>(&mut *conn)
            .await
            .optional()?
            .unwrap_or(0);
        let reserved = active_sum(&mut conn, warehouse_id, product_id, now).await?;
        Ok(i64::from(on_hand) - reserved)
    }

    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<(Order, Vec<OrderItem>)>> {
        let mut conn = self.conn().await?;
        let order = orders::table
            .find(order_id)
            .first::<Order>(&mut *conn)
            .await
            .optional()?;
        let Some(order) = order else {
            return Ok(None);
        };
        let items = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .order(order_items::product_id.asc())
            .load::<OrderItem>(&mut *conn)
            .await?;
        Ok(Some((order, items)))
    }
}

async fn active_sum(
    conn: &mut AsyncPgConnection,
    warehouse_id: Uuid,
    product_id: Uuid,
    now: DateTime<Utc>,
) -> StoreResult<i64> {
    let reserved = reservations::table
        .filter(reservations::warehouse_id.eq(warehouse_id))
        .filter(reservations::product_id.eq(product_id))
        .filter(reservations::released.eq(false))
        .filter(reservations::expires_at.gt(now))
        .select(sum(reservations::quantity))
        .get_result::<Option<i64>>(conn)
        .await?;
    Ok(reserved.unwrap_or(0))
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn find_replayed_order(&mut self, key: &str, request_hash: &str) -> StoreResult<Option<Uuid>> {
        let order_id = idempotency_keys::table
            .filter(idempotency_keys::key.eq(key))
            .filter(idempotency_keys::request_hash.eq(request_hash))
            .select(idempotency_keys::order_id)
            .first::<Option<Uuid>>(&mut *self.conn)
            .await
            .optional()?;
        Ok(order_id.flatten())
    }

    async fn insert_idempotency_key(&mut self, key: &IdempotencyKey) -> StoreResult<bool> {
        let inserted = diesel::insert_into(idempotency_keys::table)
            .values(key)
            .on_conflict(idempotency_keys::key)
            .do_nothing()
            .execute(&mut *self.conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn complete_idempotency_key(&mut self, key: &str, order_id: Uuid) -> StoreResult<()> {
        diesel::update(idempotency_keys::table.find(key))
            .set(idempotency_keys::order_id.eq(Some(order_id)))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        diesel::insert_into(orders::table)
            .values(order)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn insert_order_item(&mut self, item: &OrderItem) -> StoreResult<()> {
        diesel::insert_into(order_items::table)
            .values(item)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn active_warehouses(&mut self, shop_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let ids = warehouses::table
            .filter(warehouses::shop_id.eq(shop_id))
            .filter(warehouses::active.eq(true))
            .order(warehouses::id.asc())
            .select(warehouses::id)
            .load::<Uuid>(&mut *self.conn)
            .await?;
        Ok(ids)
    }

    async fn warehouse_exists(&mut self, warehouse_id: Uuid) -> StoreResult<bool> {
        let found = diesel::select(exists(warehouses::table.find(warehouse_id)))
            .get_result::<bool>(&mut *self.conn)
            .await?;
        Ok(found)
    }

    async fn set_warehouse_active(&mut self, warehouse_id: Uuid, active: bool) -> StoreResult<bool> {
        let updated = diesel::update(warehouses::table.find(warehouse_id))
            .set(warehouses::active.eq(active))
            .execute(&mut *self.conn)
            .await?;
        Ok(updated == 1)
    }

    async fn lock_inventory_row(&mut self, warehouse_id: Uuid, product_id: Uuid) -> StoreResult<i32> {
        let empty = InventoryRow { warehouse_id, product_id, quantity: 0 };
        diesel::insert_into(inventory::table)
            .values(&empty)
            .on_conflict((inventory::warehouse_id, inventory::product_id))
            .do_nothing()
            .execute(&mut *self.conn)
            .await?;

        let quantity = inventory::table
            .find((warehouse_id, product_id))
            .select(inventory::quantity)
            .for_update()
            .get_result::<i32>(&mut *self.conn)
            .await?;
        Ok(quantity)
    }

    async fn sum_active_reservations(
        &mut self,
        warehouse_id: Uuid,
        product_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        active_sum(&mut self.conn, warehouse_id, product_id, now).await
    }

    async fn upsert_reservation(&mut self, reservation: &Reservation) -> StoreResult<()> {
        diesel::insert_into(reservations::table)
            .values(reservation)
            .on_conflict((reservations::order_id, reservations::warehouse_id, reservations::product_id))
            .do_update()
            .set((
                reservations::quantity.eq(excluded(reservations::quantity)),
                reservations::expires_at.eq(excluded(reservations::expires_at)),
                reservations::released.eq(false),
            ))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn adjust_inventory(&mut self, warehouse_id: Uuid, product_id: Uuid, delta: i32) -> StoreResult<()> {
        diesel::update(inventory::table.find((warehouse_id, product_id)))
            .set(inventory::quantity.eq(inventory::quantity + delta))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn lock_order_status(&mut self, order_id: Uuid) -> StoreResult<Option<String>> {
        let status = orders::table
            .find(order_id)
            .select(orders::status)
            .for_update()
            .get_result::<String>(&mut *self.conn)
            .await
            .optional()?;
        Ok(status)
    }

    async fn active_reservations_for_order(
        &mut self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Reservation>> {
        let rows = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .filter(reservations::released.eq(false))
            .filter(reservations::expires_at.gt(now))
            .order((reservations::product_id.asc(), reservations::warehouse_id.asc()))
            .load::<Reservation>(&mut *self.conn)
            .await?;
        Ok(rows)
    }

    async fn release_order_reservations(&mut self, order_id: Uuid) -> StoreResult<usize> {
        let released = diesel::update(reservations::table.filter(reservations::order_id.eq(order_id)))
            .set(reservations::released.eq(true))
            .execute(&mut *self.conn)
            .await?;
        Ok(released)
    }

    async fn mark_order_paid(&mut self, order_id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        diesel::update(orders::table.find(order_id))
            .set((
                orders::status.eq(OrderStatus::Paid.as_str()),
                orders::updated_at.eq(now),
            ))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut tx = *self;
        <Txm as TransactionManager<AsyncPgConnection>>::commit_transaction(&mut *tx.conn).await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let mut tx = *self;
        <Txm as TransactionManager<AsyncPgConnection>>::rollback_transaction(&mut *tx.conn).await?;
        Ok(())
    }
}
