diesel::table! {
    product_stock (product_id) {
        product_id -> Uuid,
        available_quantity -> Int4,
        version -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        product_id -> Uuid,
        order_id -> Nullable<Uuid>,
        quantity -> Int4,
        state -> Varchar,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_movements (id) {
        id -> Uuid,
        product_id -> Uuid,
        previous_quantity -> Int4,
        new_quantity -> Int4,
        delta -> Int4,
        reason -> Varchar,
        reservation_id -> Nullable<Uuid>,
        order_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        seq -> Int8,
    }
}

diesel::table! {
    idempotency_records (event_key) {
        event_key -> Varchar,
        status -> Varchar,
        result_summary -> Nullable<Jsonb>,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        expires_at -> Timestamptz,
    }
}

diesel::joinable!(reservations -> product_stock (product_id));
diesel::joinable!(stock_movements -> product_stock (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    idempotency_records,
    product_stock,
    reservations,
    stock_movements,
);
