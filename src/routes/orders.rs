use std::collections::HashMap;

use anyhow::{Context, Result};
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    catalog,
    middleware::{self},
    models::{
        CartEntity, CartItemEntity, CreateOrderEntity, CreateOrderItemEntity, OrderEntity,
        OrderItemEntity,
    },
    pricing,
    schema::{cart_items, carts, order_items, orders},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/orders",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_orders))
            .routes(utoipa_axum::routes!(get_order))
            .routes(utoipa_axum::routes!(create_order))
            .route_layer(axum::middleware::from_fn(
                middleware::customers_authorization,
            )),
    )
}

#[derive(Serialize, ToSchema)]
pub struct OrderItemDto {
    pub product_id: i32,
    pub product_name: String,
    pub product_image_url: Option<String>,
    pub price: f64,
    pub quantity: i32,
}

#[derive(Serialize, ToSchema)]
pub struct OrderDto {
    pub id: i32,
    pub order_date: DateTime<Utc>,
    pub full_name: String,
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub country: String,
    pub subtotal: f64,
    pub shipping_fee: f64,
    pub grand_total: f64,
    pub items: Vec<OrderItemDto>,
}

fn to_order_dto(order: OrderEntity, items: Vec<OrderItemEntity>) -> OrderDto {
    OrderDto {
        id: order.id,
        order_date: order.created_at,
        full_name: order.full_name,
        address_line1: order.address_line1,
        address_line2: order.address_line2,
        city: order.city,
        postal_code: order.postal_code,
        country: order.country,
        subtotal: order.subtotal,
        shipping_fee: order.shipping_fee,
        grand_total: order.grand_total,
        items: items
            .into_iter()
            .map(|item| OrderItemDto {
                product_id: item.product_id,
                product_name: item.product_name,
                product_image_url: item.product_image_url,
                price: item.price,
                quantity: item.quantity,
            })
            .collect(),
    }
}

#[derive(Deserialize, ToSchema)]
struct CreateOrderReq {
    pub full_name: String,
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub country: String,
}

impl CreateOrderReq {
    fn validate(&self) -> Result<(), AppError> {
        let required = [
            ("full_name", &self.full_name),
            ("address_line1", &self.address_line1),
            ("city", &self.city),
            ("postal_code", &self.postal_code),
            ("country", &self.country),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(AppError::BadRequest(format!("{field} is required")));
            }
        }
        Ok(())
    }
}

/// Convert the caller's cart into an immutable order.
///
/// One transaction covers the whole read-snapshot-write-delete sequence, with
/// the cart row locked up front: a concurrent or retried checkout waits on
/// the lock and then finds no cart, so a cart state converts at most once and
/// an order never exists without its cart having been consumed.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Orders"],
    request_body = CreateOrderReq,
    responses(
        (status = 200, description = "Order placed, cart consumed", body = StdResponse<OrderDto, String>)
    )
)]
async fn create_order(
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
    Json(body): Json<CreateOrderReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cart: Option<CartEntity> = carts::table
                    .filter(carts::owner_id.eq(&owner_id))
                    .select(CartEntity::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;

                // An absent cart and an already-consumed cart are the same
                // thing to the caller: nothing left to check out.
                let Some(cart) = cart else {
                    return Err(AppError::EmptyCart);
                };

                let items: Vec<CartItemEntity> = cart_items::table
                    .filter(cart_items::cart_id.eq(cart.id))
                    .order_by(cart_items::id.asc())
                    .select(CartItemEntity::as_select())
                    .get_results(conn)
                    .await
                    .context("Failed to get cart items")?;

                if items.is_empty() {
                    return Err(AppError::EmptyCart);
                }

                let product_ids: Vec<i32> = items.iter().map(|item| item.product_id).collect();
                let products = catalog::get_products(conn, &product_ids).await?;

                // Snapshot name/image/price now; the order must stay stable
                // against later catalog changes.
                let mut lines = Vec::with_capacity(items.len());
                for item in &items {
                    let product = products.get(&item.product_id).ok_or(AppError::NotFound)?;
                    lines.push((product.clone(), item.quantity));
                }

                let totals = pricing::order_totals(
                    &lines
                        .iter()
                        .map(|(product, quantity)| (product.price, *quantity))
                        .collect::<Vec<_>>(),
                );

                let order: OrderEntity = diesel::insert_into(orders::table)
                    .values(CreateOrderEntity {
                        owner_id,
                        full_name: body.full_name,
                        address_line1: body.address_line1,
                        address_line2: body.address_line2,
                        city: body.city,
                        postal_code: body.postal_code,
                        country: body.country,
                        subtotal: totals.subtotal,
                        shipping_fee: totals.shipping_fee,
                        grand_total: totals.grand_total,
                    })
                    .returning(OrderEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create order")?;

                let new_items: Vec<CreateOrderItemEntity> = lines
                    .into_iter()
                    .map(|(product, quantity)| CreateOrderItemEntity {
                        order_id: order.id,
                        product_id: product.id,
                        product_name: product.name,
                        product_image_url: product.image_url,
                        price: product.price,
                        quantity,
                    })
                    .collect();

                let order_items: Vec<OrderItemEntity> =
                    diesel::insert_into(order_items::table)
                        .values(new_items)
                        .returning(OrderItemEntity::as_returning())
                        .get_results(conn)
                        .await
                        .context("Failed to create order items")?;

                // Consume the cart in the same transaction; a subsequent
                // get-or-create yields a fresh empty cart.
                diesel::delete(cart_items::table.filter(cart_items::cart_id.eq(cart.id)))
                    .execute(conn)
                    .await
                    .context("Failed to clear cart items")?;
                diesel::delete(carts::table.find(cart.id))
                    .execute(conn)
                    .await
                    .context("Failed to delete cart")?;

                Ok::<OrderDto, AppError>(to_order_dto(order, order_items))
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Order placed successfully"),
    })
}

/// Fetch all orders belonging to the authenticated customer, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Orders"],
    responses(
        (status = 200, description = "List the caller's orders", body = StdResponse<Vec<OrderDto>, String>)
    )
)]
async fn get_orders(
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let orders: Vec<OrderEntity> = orders::table
        .filter(orders::owner_id.eq(&owner_id))
        .order_by(orders::created_at.desc())
        .select(OrderEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get orders")?;

    let order_ids: Vec<i32> = orders.iter().map(|order| order.id).collect();
    let items: Vec<OrderItemEntity> = order_items::table
        .filter(order_items::order_id.eq_any(&order_ids))
        .select(OrderItemEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get order items")?;

    let mut group: HashMap<i32, Vec<OrderItemEntity>> = HashMap::new();
    for item in items {
        group.entry(item.order_id).or_default().push(item);
    }

    let orders_with_items: Vec<OrderDto> = orders
        .into_iter()
        .map(|order| {
            let items = group.remove(&order.id).unwrap_or_default();
            to_order_dto(order, items)
        })
        .collect();

    Ok(StdResponse {
        data: Some(orders_with_items),
        message: Some("Get orders successfully"),
    })
}

/// Fetch a specific order belonging to the authenticated customer.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Orders"],
    params(
        ("id" = i32, Path, description = "Order ID to fetch")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<OrderDto, String>)
    )
)]
async fn get_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order: Option<OrderEntity> = orders::table
        .find(id)
        .filter(orders::owner_id.eq(&owner_id))
        .select(OrderEntity::as_select())
        .first(conn)
        .await
        .optional()?;
    let Some(order) = order else {
        return Err(AppError::NotFound);
    };

    let items: Vec<OrderItemEntity> = order_items::table
        .filter(order_items::order_id.eq(order.id))
        .select(OrderItemEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get order items")?;

    Ok(StdResponse {
        data: Some(to_order_dto(order, items)),
        message: Some("Get order successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: i32) -> OrderEntity {
        OrderEntity {
            id,
            owner_id: "alice".to_string(),
            full_name: "Alice Doe".to_string(),
            address_line1: "1 Main St".to_string(),
            address_line2: None,
            city: "Springfield".to_string(),
            postal_code: "12345".to_string(),
            country: "US".to_string(),
            subtotal: 25.00,
            shipping_fee: 9.99,
            grand_total: 34.99,
            created_at: Utc::now(),
        }
    }

    fn order_item(id: i32, order_id: i32, price: f64, quantity: i32) -> OrderItemEntity {
        OrderItemEntity {
            id,
            order_id,
            product_id: id,
            product_name: format!("Product {id}"),
            product_image_url: None,
            price,
            quantity,
        }
    }

    fn valid_req() -> CreateOrderReq {
        CreateOrderReq {
            full_name: "Alice Doe".to_string(),
            address_line1: "1 Main St".to_string(),
            address_line2: None,
            city: "Springfield".to_string(),
            postal_code: "12345".to_string(),
            country: "US".to_string(),
        }
    }

    #[test]
    fn order_dto_preserves_snapshots_and_totals() {
        let dto = to_order_dto(
            order(42),
            vec![order_item(1, 42, 10.00, 2), order_item(2, 42, 5.00, 1)],
        );

        assert_eq!(dto.id, 42);
        assert_eq!(dto.items.len(), 2);
        assert_eq!(dto.items[0].price, 10.00);
        // Conservation: subtotal matches the lines, grand total adds the fee.
        let line_sum: f64 = dto
            .items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum();
        assert_eq!(dto.subtotal, line_sum);
        assert_eq!(dto.grand_total, dto.subtotal + dto.shipping_fee);
    }

    #[test]
    fn shipping_address_requires_core_fields() {
        assert!(valid_req().validate().is_ok());

        let mut req = valid_req();
        req.full_name = "   ".to_string();
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));

        let mut req = valid_req();
        req.country = String::new();
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));

        // Second address line stays optional.
        let mut req = valid_req();
        req.address_line2 = Some(String::new());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn order_dto_serializes_expected_shape() {
        let dto = to_order_dto(order(42), vec![order_item(1, 42, 10.00, 2)]);
        let value = serde_json::to_value(&dto).unwrap();

        assert_eq!(value["id"], 42);
        assert_eq!(value["subtotal"], 25.00);
        assert_eq!(value["items"][0]["product_name"], "Product 1");
        assert_eq!(value["items"][0]["quantity"], 2);
        // Snapshots live on the item, not behind a product reference.
        assert!(value["items"][0].get("product").is_none());
    }
}
