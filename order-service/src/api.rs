use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::{cors::{Any, CorsLayer}, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, warn};
use uuid::Uuid;
use shared::*;
use crate::error::OrderError;
use crate::orders::OrdersService;
use crate::warehouses::WarehousesService;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct AppState {
    pub orders: OrdersService,
    pub warehouses: WarehousesService,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, message: &str, detail: impl Into<String>) -> Self {
        Self { status, body: ErrorResponse::new(message, detail) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.body.error, "{}", self.body.message);
        } else {
            warn!(status = %self.status, error = %self.body.error, "{}", self.body.message);
        }
        (self.status, Json(self.body)).into_response()
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        let detail = err.to_string();
        match err {
            OrderError::Validation(_) => ApiError::new(StatusCode::BAD_REQUEST, "Validation error", detail),
            OrderError::InsufficientStock { .. } => ApiError::new(StatusCode::CONFLICT, "Insufficient stock", detail),
            OrderError::IdempotencyConflict(_) => {
                ApiError::new(StatusCode::CONFLICT, "Idempotency key conflict", detail)
            }
            OrderError::OrderNotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "Order not found", detail),
            OrderError::InvalidOrderState { .. } => ApiError::new(StatusCode::CONFLICT, "Invalid order state", detail),
            OrderError::WarehouseNotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "Warehouse not found", detail),
            OrderError::Store(_) => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable", detail),
        }
    }
}

type ApiResult<T> = Result<Json<SuccessResponse<T>>, ApiError>;

pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/api/healthz", get(health_check))
        .route("/api/orders", post(create_order))
        .route("/api/orders/:id", get(get_order))
        .route("/api/orders/:id/pay", post(pay_order))
        .route("/api/warehouses/transfer", post(transfer_stock))
        .route("/api/warehouses/:id/activate", post(activate_warehouse))
        .route("/api/warehouses/:id/deactivate", post(deactivate_warehouse))
        .route(
            "/api/warehouses/:id/products/:product_id/availability",
            get(availability),
        )
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "time": chrono::Utc::now() }))
}

/// The raw body is hashed as received, so a retry must resend identical bytes
/// to be recognised.
pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<OrderResponse> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing Idempotency-Key", ""))?;

    let request: CreateOrderRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "Invalid JSON", e.to_string()))?;

    let order_id = state
        .orders
        .create(idempotency_key, &body, request.shop_id, &request.items)
        .await?;

    Ok(Json(SuccessResponse::new(
        "Order reserved",
        OrderResponse { id: order_id, status: OrderStatus::Reserved },
    )))
}

/// Missing and already-paid orders are reported identically; the detail
/// string tells them apart.
pub async fn pay_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<OrderResponse> {
    state.orders.pay(order_id).await.map_err(|err| match err {
        OrderError::OrderNotFound(_) | OrderError::InvalidOrderState { .. } => {
            ApiError::new(StatusCode::BAD_REQUEST, "Cannot pay", err.to_string())
        }
        other => other.into(),
    })?;

    Ok(Json(SuccessResponse::new(
        "Order paid",
        OrderResponse { id: order_id, status: OrderStatus::Paid },
    )))
}

pub async fn get_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<OrderDetails> {
    let details = state.orders.order(order_id).await?;
    Ok(Json(SuccessResponse::new("Order found", details)))
}

pub async fn availability(
    State(state): State<AppState>,
    Path((warehouse_id, product_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<AvailabilityResponse> {
    let available = state.orders.availability(warehouse_id, product_id).await?;
    Ok(Json(SuccessResponse::new(
        "Availability",
        AvailabilityResponse { warehouse_id, product_id, available },
    )))
}

pub async fn activate_warehouse(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<WarehouseResponse> {
    state.warehouses.set_active(id, true).await?;
    Ok(Json(SuccessResponse::new("Warehouse activated", WarehouseResponse { id, active: true })))
}

pub async fn deactivate_warehouse(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<WarehouseResponse> {
    state.warehouses.set_active(id, false).await?;
    Ok(Json(SuccessResponse::new("Warehouse deactivated", WarehouseResponse { id, active: false })))
}

pub async fn transfer_stock(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> ApiResult<TransferResponse> {
    state
        .warehouses
        .transfer(request.from, request.to, request.product_id, request.quantity)
        .await?;

    Ok(Json(SuccessResponse::new(
        "Stock transferred",
        TransferResponse {
            from: request.from,
            to: request.to,
            product_id: request.product_id,
            quantity: request.quantity,
            status: "completed".to_string(),
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::{MemoryStore, Store};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: MemoryStore,
        shop_id: Uuid,
    }

    fn test_app() -> TestApp {
        let store = MemoryStore::new();
        let shared_store: Arc<dyn Store> = Arc::new(store.clone());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let state = AppState {
            orders: OrdersService::new(shared_store.clone(), clock.clone(), chrono::Duration::minutes(15)),
            warehouses: WarehousesService::new(shared_store, clock),
        };
        TestApp {
            router: create_router(state, Duration::from_secs(5)),
            store,
            shop_id: Uuid::new_v4(),
        }
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
            (status, body)
        }

        async fn create(&self, key: Option<&str>, body: &Value) -> (StatusCode, Value) {
            let mut builder = Request::post("/api/orders").header("content-type", "application/json");
            if let Some(key) = key {
                builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
            }
            self.send(builder.body(Body::from(body.to_string())).unwrap()).await
        }

        async fn post(&self, uri: &str) -> (StatusCode, Value) {
            self.send(Request::post(uri).body(Body::empty()).unwrap()).await
        }
    }

    #[tokio::test]
    async fn health_check_reports_ok() {
        let app = test_app();
        let (status, body) = app.send(Request::get("/api/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn create_requires_idempotency_key() {
        let app = test_app();
        let body = json!({ "shop_id": app.shop_id, "items": [{ "product_id": Uuid::new_v4(), "quantity": 1 }] });

        let (status, response) = app.create(None, &body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["status"], "error");
        assert_eq!(response["message"], "Missing Idempotency-Key");
    }

    #[tokio::test]
    async fn create_rejects_malformed_and_invalid_bodies() {
        let app = test_app();

        let (status, response) = app.create(Some("k1"), &json!({ "shop_id": "nope" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["message"], "Invalid JSON");

        let (status, response) = app.create(Some("k1"), &json!({ "shop_id": app.shop_id, "items": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["message"], "Validation error");
    }

    #[tokio::test]
    async fn reserve_then_pay_then_pay_again() {
        let app = test_app();
        let warehouse = app.store.add_warehouse(app.shop_id, true).await;
        let product = Uuid::new_v4();
        app.store.set_stock(warehouse, product, 10).await;
        let body = json!({ "shop_id": app.shop_id, "items": [{ "product_id": product, "quantity": 7 }] });

        let (status, created) = app.create(Some("k1"), &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["data"]["status"], "reserved");
        let order_id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, replayed) = app.create(Some("k1"), &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replayed["data"]["id"], order_id.as_str());

        let (status, paid) = app.post(&format!("/api/orders/{order_id}/pay")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paid["data"]["status"], "paid");
        assert_eq!(app.store.on_hand(warehouse, product).await, Some(3));

        let (status, again) = app.post(&format!("/api/orders/{order_id}/pay")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(again["message"], "Cannot pay");
        assert_eq!(app.store.on_hand(warehouse, product).await, Some(3));

        let (status, details) = app
            .send(Request::get(format!("/api/orders/{order_id}")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details["data"]["status"], "paid");
    }

    #[tokio::test]
    async fn paying_unknown_order_reads_like_a_paid_one() {
        let app = test_app();
        let (status, response) = app.post(&format!("/api/orders/{}/pay", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["message"], "Cannot pay");
        assert!(response["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn short_stock_is_a_conflict() {
        let app = test_app();
        let warehouse = app.store.add_warehouse(app.shop_id, true).await;
        let product = Uuid::new_v4();
        app.store.set_stock(warehouse, product, 3).await;
        let body = json!({ "shop_id": app.shop_id, "items": [{ "product_id": product, "quantity": 5 }] });

        let (status, response) = app.create(Some("k1"), &body).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(response["message"], "Insufficient stock");
    }

    #[tokio::test]
    async fn warehouse_endpoints_toggle_transfer_and_report_availability() {
        let app = test_app();
        let from = app.store.add_warehouse(app.shop_id, true).await;
        let to = app.store.add_warehouse(app.shop_id, true).await;
        let product = Uuid::new_v4();
        app.store.set_stock(from, product, 6).await;

        let (status, _) = app.post(&format!("/api/warehouses/{to}/deactivate")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.post(&format!("/api/warehouses/{}/activate", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let transfer = json!({ "from": from, "to": to, "product_id": product, "quantity": 4 });
        let (status, response) = app
            .send(
                Request::post("/api/warehouses/transfer")
                    .header("content-type", "application/json")
                    .body(Body::from(transfer.to_string()))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["data"]["status"], "completed");

        let uri = format!("/api/warehouses/{to}/products/{product}/availability");
        let (status, response) = app.send(Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["data"]["available"], 4);
    }
}
