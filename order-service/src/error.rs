use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

/// Infrastructure failures raised by a [`crate::store::Store`].
///
/// Every variant is treated as transient: the transaction has been (or will
/// be) rolled back and the caller may retry.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Failures of the order, payment and warehouse workflows.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock for product {product_id}: requested {requested}")]
    InsufficientStock { product_id: Uuid, requested: i32 },

    #[error("idempotency key {0:?} was already used for a different request")]
    IdempotencyConflict(String),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("order {order_id} is {status}, only reserved orders can be paid")]
    InvalidOrderState { order_id: Uuid, status: String },

    #[error("warehouse {0} not found")]
    WarehouseNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether repeating the same call unchanged may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, OrderError::InsufficientStock { .. } | OrderError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stock_and_store_failures_are_retriable() {
        let product_id = Uuid::new_v4();
        assert!(OrderError::InsufficientStock { product_id, requested: 3 }.is_retriable());
        assert!(OrderError::Store(StoreError::Pool("timed out".into())).is_retriable());
        assert!(!OrderError::validation("items must not be empty").is_retriable());
        assert!(!OrderError::OrderNotFound(product_id).is_retriable());
        assert!(!OrderError::IdempotencyConflict("k1".into()).is_retriable());
    }

    #[test]
    fn store_errors_keep_their_message() {
        let err: OrderError = StoreError::Database(diesel::result::Error::NotFound).into();
        assert_eq!(err.to_string(), "database error: Record not found");
    }
}
