use std::collections::HashMap;

use anyhow::{Context, Result};
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    catalog,
    middleware::{self},
    models::{CartEntity, CartItemEntity, CreateCartEntity, CreateCartItemEntity, ProductEntity},
    pricing,
    schema::{cart_items, carts},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/cart",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_cart))
            .routes(utoipa_axum::routes!(add_item))
            .routes(utoipa_axum::routes!(update_item_quantity))
            .routes(utoipa_axum::routes!(remove_item))
            .route_layer(axum::middleware::from_fn(
                middleware::customers_authorization,
            )),
    )
}

/// Cart line priced live against the current catalog price.
#[derive(Debug, Serialize, ToSchema)]
pub struct CartItemDto {
    pub id: i32,
    pub product_id: i32,
    pub product_name: String,
    pub product_image_url: Option<String>,
    pub price: f64,
    pub quantity: i32,
    pub line_total: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartDto {
    pub id: i32,
    pub owner_id: String,
    pub items: Vec<CartItemDto>,
    pub grand_total: f64,
}

fn build_cart_dto(
    cart: CartEntity,
    items: Vec<CartItemEntity>,
    products: &HashMap<i32, ProductEntity>,
) -> Result<CartDto, AppError> {
    let mut lines = Vec::with_capacity(items.len());
    let mut grand_total = 0.0;
    for item in items {
        let product = products.get(&item.product_id).ok_or(AppError::NotFound)?;
        let line_total = pricing::round2(product.price * f64::from(item.quantity));
        grand_total += line_total;
        lines.push(CartItemDto {
            id: item.id,
            product_id: item.product_id,
            product_name: product.name.clone(),
            product_image_url: product.image_url.clone(),
            price: product.price,
            quantity: item.quantity,
            line_total,
        });
    }
    Ok(CartDto {
        id: cart.id,
        owner_id: cart.owner_id,
        items: lines,
        grand_total: pricing::round2(grand_total),
    })
}

async fn load_cart_dto(
    conn: &mut AsyncPgConnection,
    cart: CartEntity,
) -> Result<CartDto, AppError> {
    let items: Vec<CartItemEntity> = cart_items::table
        .filter(cart_items::cart_id.eq(cart.id))
        .order_by(cart_items::id.asc())
        .select(CartItemEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get cart items")?;

    let product_ids: Vec<i32> = items.iter().map(|item| item.product_id).collect();
    let products = catalog::get_products(conn, &product_ids).await?;

    build_cart_dto(cart, items, &products)
}

/// Fetches the owner's cart, creating an empty one on first access. The
/// unique index on `carts.owner_id` keeps this to one cart per owner even
/// when two first requests race.
async fn get_or_create_cart(
    conn: &mut AsyncPgConnection,
    owner_id: &str,
) -> Result<CartEntity, AppError> {
    if let Some(cart) = carts::table
        .filter(carts::owner_id.eq(owner_id))
        .select(CartEntity::as_select())
        .first(conn)
        .await
        .optional()?
    {
        return Ok(cart);
    }

    let inserted: Option<CartEntity> = diesel::insert_into(carts::table)
        .values(CreateCartEntity {
            owner_id: owner_id.to_string(),
        })
        .on_conflict(carts::owner_id)
        .do_nothing()
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .optional()?;

    match inserted {
        Some(cart) => Ok(cart),
        // Lost the creation race; the winner's row exists now.
        None => Ok(carts::table
            .filter(carts::owner_id.eq(owner_id))
            .select(CartEntity::as_select())
            .first(conn)
            .await?),
    }
}

/// Like [`get_or_create_cart`] but takes the cart row lock, serializing
/// concurrent mutations of the same cart. Must run inside a transaction.
async fn lock_cart(conn: &mut AsyncPgConnection, owner_id: &str) -> Result<CartEntity, AppError> {
    if let Some(cart) = carts::table
        .filter(carts::owner_id.eq(owner_id))
        .select(CartEntity::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
    {
        return Ok(cart);
    }

    let inserted: Option<CartEntity> = diesel::insert_into(carts::table)
        .values(CreateCartEntity {
            owner_id: owner_id.to_string(),
        })
        .on_conflict(carts::owner_id)
        .do_nothing()
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .optional()?;

    match inserted {
        Some(cart) => Ok(cart),
        None => Ok(carts::table
            .filter(carts::owner_id.eq(owner_id))
            .select(CartEntity::as_select())
            .for_update()
            .first(conn)
            .await?),
    }
}

async fn touch_cart(conn: &mut AsyncPgConnection, cart_id: i32) -> Result<(), AppError> {
    diesel::update(carts::table.find(cart_id))
        .set(carts::updated_at.eq(diesel::dsl::now))
        .execute(conn)
        .await
        .context("Failed to update cart timestamp")?;
    Ok(())
}

/// Fetch the authenticated customer's cart, creating it on first access.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Cart"],
    responses(
        (status = 200, description = "The caller's cart, freshly priced", body = StdResponse<CartDto, String>)
    )
)]
async fn get_cart(
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = get_or_create_cart(conn, &owner_id).await?;
    let cart = load_cart_dto(conn, cart).await?;

    Ok(StdResponse {
        data: Some(cart),
        message: Some("Get cart successfully"),
    })
}

#[derive(Deserialize, ToSchema)]
struct AddCartItemReq {
    pub product_id: i32,
    pub quantity: i32,
}

/// Add a product to the cart, incrementing the quantity if it is already there.
#[utoipa::path(
    post,
    path = "/items",
    tags = ["Cart"],
    request_body = AddCartItemReq,
    responses(
        (status = 200, description = "Item added, updated cart returned", body = StdResponse<CartDto, String>)
    )
)]
async fn add_item(
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
    Json(body): Json<AddCartItemReq>,
) -> Result<impl IntoResponse, AppError> {
    if body.quantity < 1 {
        return Err(AppError::BadRequest("Quantity must be at least 1".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    catalog::get_product(conn, body.product_id).await?;

    let cart = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cart = lock_cart(conn, &owner_id).await?;

                // Single-statement upsert: the increment happens in the
                // database, so concurrent adds of the same product both land.
                diesel::insert_into(cart_items::table)
                    .values(CreateCartItemEntity {
                        cart_id: cart.id,
                        product_id: body.product_id,
                        quantity: body.quantity,
                    })
                    .on_conflict((cart_items::cart_id, cart_items::product_id))
                    .do_update()
                    .set((
                        cart_items::quantity.eq(cart_items::quantity + body.quantity),
                        cart_items::updated_at.eq(diesel::dsl::now),
                    ))
                    .execute(conn)
                    .await
                    .context("Failed to upsert cart item")?;

                touch_cart(conn, cart.id).await?;
                load_cart_dto(conn, cart).await
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(cart),
        message: Some("Item added to cart"),
    })
}

#[derive(Deserialize, ToSchema)]
struct UpdateCartItemQuantityReq {
    pub quantity: i32,
}

/// Set the quantity of a cart line. Setting to zero is not supported here;
/// callers use the DELETE route instead.
#[utoipa::path(
    put,
    path = "/items/{id}",
    tags = ["Cart"],
    params(
        ("id" = i32, Path, description = "Cart item ID to update")
    ),
    request_body = UpdateCartItemQuantityReq,
    responses(
        (status = 200, description = "Quantity updated, updated cart returned", body = StdResponse<CartDto, String>)
    )
)]
async fn update_item_quantity(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
    Json(body): Json<UpdateCartItemQuantityReq>,
) -> Result<impl IntoResponse, AppError> {
    if body.quantity < 1 {
        return Err(AppError::BadRequest(
            "Quantity must be at least 1; remove the item instead of setting it to 0".into(),
        ));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cart = lock_cart(conn, &owner_id).await?;

                let updated = diesel::update(
                    cart_items::table
                        .find(id)
                        .filter(cart_items::cart_id.eq(cart.id)),
                )
                .set((
                    cart_items::quantity.eq(body.quantity),
                    cart_items::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .await
                .context("Failed to update cart item quantity")?;

                // Zero rows is unambiguous under the cart lock: the item does
                // not exist in the caller's cart.
                if updated == 0 {
                    return Err(AppError::NotFound);
                }

                touch_cart(conn, cart.id).await?;
                load_cart_dto(conn, cart).await
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(cart),
        message: Some("Cart item quantity updated"),
    })
}

/// Remove a line from the cart.
#[utoipa::path(
    delete,
    path = "/items/{id}",
    tags = ["Cart"],
    params(
        ("id" = i32, Path, description = "Cart item ID to remove")
    ),
    responses(
        (status = 200, description = "Item removed, updated cart returned", body = StdResponse<CartDto, String>)
    )
)]
async fn remove_item(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cart = lock_cart(conn, &owner_id).await?;

                let deleted = diesel::delete(
                    cart_items::table
                        .find(id)
                        .filter(cart_items::cart_id.eq(cart.id)),
                )
                .execute(conn)
                .await
                .context("Failed to delete cart item")?;

                if deleted == 0 {
                    return Err(AppError::NotFound);
                }

                touch_cart(conn, cart.id).await?;
                load_cart_dto(conn, cart).await
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(cart),
        message: Some("Item removed from cart"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn product(id: i32, name: &str, price: f64) -> ProductEntity {
        ProductEntity {
            id,
            name: name.to_string(),
            description: None,
            price,
            image_url: Some(format!("/img/{id}.jpg")),
            category: "Shirts".to_string(),
            average_rating: None,
            number_of_reviews: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn cart_item(id: i32, cart_id: i32, product_id: i32, quantity: i32) -> CartItemEntity {
        CartItemEntity {
            id,
            cart_id,
            product_id,
            quantity,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn cart(id: i32, owner_id: &str) -> CartEntity {
        CartEntity {
            id,
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn cart_dto_prices_lines_against_catalog() {
        let products: HashMap<i32, ProductEntity> = [
            (1, product(1, "Tee", 10.00)),
            (2, product(2, "Mug", 5.00)),
        ]
        .into();
        let items = vec![cart_item(11, 7, 1, 2), cart_item(12, 7, 2, 1)];

        let dto = build_cart_dto(cart(7, "alice"), items, &products).unwrap();

        assert_eq!(dto.items.len(), 2);
        assert_eq!(dto.items[0].product_name, "Tee");
        assert_eq!(dto.items[0].line_total, 20.00);
        assert_eq!(dto.items[1].line_total, 5.00);
        assert_eq!(dto.grand_total, 25.00);
    }

    #[test]
    fn empty_cart_totals_zero() {
        let dto = build_cart_dto(cart(7, "alice"), vec![], &HashMap::new()).unwrap();
        assert!(dto.items.is_empty());
        assert_eq!(dto.grand_total, 0.0);
    }

    #[test]
    fn unresolvable_product_fails_not_found() {
        let items = vec![cart_item(11, 7, 99, 1)];
        let err = build_cart_dto(cart(7, "alice"), items, &HashMap::new()).unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[test]
    fn line_totals_are_rounded_to_cents() {
        let products: HashMap<i32, ProductEntity> = [(1, product(1, "Sticker", 0.10))].into();
        let items = vec![cart_item(11, 7, 1, 3)];

        let dto = build_cart_dto(cart(7, "alice"), items, &products).unwrap();
        assert_eq!(dto.items[0].line_total, 0.30);
        assert_eq!(dto.grand_total, 0.30);
    }
}
