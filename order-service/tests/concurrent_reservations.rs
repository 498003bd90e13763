use std::sync::Arc;
use chrono::Duration;
use futures::future::join_all;
use order_service::clock::{Clock, ManualClock};
use order_service::error::OrderError;
use order_service::orders::OrdersService;
use order_service::store::{MemoryStore, Store};
use shared::OrderItemRequest;
use uuid::Uuid;

fn service(store: &MemoryStore, clock: &ManualClock) -> OrdersService {
    let store: Arc<dyn Store> = Arc::new(store.clone());
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    OrdersService::new(store, clock, Duration::minutes(15))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_orders_never_oversell() {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let orders = service(&store, &clock);
    let shop_id = Uuid::new_v4();
    let product = Uuid::new_v4();
    let north = store.add_warehouse(shop_id, true).await;
    let south = store.add_warehouse(shop_id, true).await;
    store.set_stock(north, product, 7).await;
    store.set_stock(south, product, 5).await;

    let tasks = (0..20).map(|i| {
        let orders = orders.clone();
        tokio::spawn(async move {
            let items = [OrderItemRequest { product_id: product, quantity: 2 }];
            let body = format!("order-{i}");
            orders.create(&format!("key-{i}"), body.as_bytes(), shop_id, &items).await
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let created = results.iter().filter(|r| r.is_ok()).count();
    let short = results
        .iter()
        .filter(|r| matches!(r, Err(OrderError::InsufficientStock { .. })))
        .count();
    // A single warehouse must cover each line: 7 / 2 = 3 and 5 / 2 = 2.
    assert_eq!(created, 5);
    assert_eq!(short, 15);

    for warehouse in [north, south] {
        let available = orders.availability(warehouse, product).await.unwrap();
        assert!(available >= 0);
        assert!(available < 2);
    }
    assert_eq!(store.order_count().await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_share_one_order() {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let orders = service(&store, &clock);
    let shop_id = Uuid::new_v4();
    let product = Uuid::new_v4();
    let warehouse = store.add_warehouse(shop_id, true).await;
    store.set_stock(warehouse, product, 100).await;

    let tasks = (0..10).map(|_| {
        let orders = orders.clone();
        tokio::spawn(async move {
            let items = [OrderItemRequest { product_id: product, quantity: 3 }];
            orders.create("retry-key", b"same-body", shop_id, &items).await
        })
    });
    let ids: Vec<Uuid> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(store.order_count().await, 1);
    assert_eq!(orders.availability(warehouse, product).await.unwrap(), 97);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payments_and_sweeps_race_without_double_release() {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let orders = service(&store, &clock);
    let shop_id = Uuid::new_v4();
    let product = Uuid::new_v4();
    let warehouse = store.add_warehouse(shop_id, true).await;
    store.set_stock(warehouse, product, 10).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let items = [OrderItemRequest { product_id: product, quantity: 2 }];
        let body = format!("order-{i}");
        ids.push(orders.create(&format!("key-{i}"), body.as_bytes(), shop_id, &items).await.unwrap());
    }
    assert_eq!(orders.availability(warehouse, product).await.unwrap(), 0);

    let pays = ids.iter().take(3).map(|id| {
        let orders = orders.clone();
        let id = *id;
        tokio::spawn(async move { orders.pay(id).await })
    });
    for result in join_all(pays).await {
        result.unwrap().unwrap();
    }
    assert_eq!(store.on_hand(warehouse, product).await, Some(4));

    clock.advance(Duration::minutes(16));
    let sweeps = (0..3).map(|_| {
        let orders = orders.clone();
        tokio::spawn(async move { orders.sweep_expired(500).await })
    });
    let released: usize = join_all(sweeps).await.into_iter().map(|r| r.unwrap().unwrap()).sum();

    assert_eq!(released, 2);
    assert_eq!(store.on_hand(warehouse, product).await, Some(4));
    assert_eq!(orders.availability(warehouse, product).await.unwrap(), 4);
}
