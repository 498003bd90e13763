diesel::table! {
    idempotency_keys (key) {
        key -> Varchar,
        user_id -> Uuid,
        request_hash -> Varchar,
        order_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    inventory (warehouse_id, product_id) {
        warehouse_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
    }
}

diesel::table! {
    order_items (order_id, product_id) {
        order_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        shop_id -> Uuid,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        warehouse_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        expires_at -> Timestamptz,
        released -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    warehouses (id) {
        id -> Uuid,
        shop_id -> Uuid,
        name -> Varchar,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(reservations -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    idempotency_keys,
    inventory,
    order_items,
    orders,
    reservations,
    warehouses,
);
