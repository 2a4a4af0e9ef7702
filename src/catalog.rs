use std::collections::HashMap;

use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::{app_error::AppError, models::ProductEntity, schema::products};

/// Narrow surface through which the cart, checkout and review flows reach the
/// product catalog. Callers hold product ids only, never live references.
pub async fn get_product(
    conn: &mut AsyncPgConnection,
    product_id: i32,
) -> Result<ProductEntity, AppError> {
    let product = products::table
        .find(product_id)
        .select(ProductEntity::as_select())
        .first(conn)
        .await
        .optional()?;
    product.ok_or(AppError::NotFound)
}

/// Same as [`get_product`] but takes a row lock, serializing concurrent
/// writers of the product's rating aggregate.
pub async fn get_product_for_update(
    conn: &mut AsyncPgConnection,
    product_id: i32,
) -> Result<ProductEntity, AppError> {
    let product = products::table
        .find(product_id)
        .select(ProductEntity::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?;
    product.ok_or(AppError::NotFound)
}

/// Batch lookup keyed by product id, for pricing a whole cart in one query.
pub async fn get_products(
    conn: &mut AsyncPgConnection,
    product_ids: &[i32],
) -> Result<HashMap<i32, ProductEntity>, AppError> {
    let products: Vec<ProductEntity> = products::table
        .filter(products::id.eq_any(product_ids))
        .select(ProductEntity::as_select())
        .get_results(conn)
        .await?;
    Ok(products.into_iter().map(|p| (p.id, p)).collect())
}

pub async fn update_rating_aggregate(
    conn: &mut AsyncPgConnection,
    product_id: i32,
    average_rating: Option<f64>,
    review_count: i32,
) -> Result<(), AppError> {
    diesel::update(products::table.find(product_id))
        .set((
            products::average_rating.eq(average_rating),
            products::number_of_reviews.eq(review_count),
            products::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}
