use anyhow::{Context, Result};
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    catalog,
    middleware::{self},
    models::{CreateReviewEntity, ReviewEntity},
    pricing,
    schema::reviews,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/products/{product_id}/reviews",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(submit_review))
            .route_layer(axum::middleware::from_fn(
                middleware::customers_authorization,
            ))
            .routes(utoipa_axum::routes!(get_reviews)),
    )
}

#[derive(Serialize, ToSchema)]
pub struct ReviewDto {
    pub id: i32,
    pub user_id: String,
    pub rating: i32,
    pub comment: Option<String>,
    pub review_date: DateTime<Utc>,
}

impl From<ReviewEntity> for ReviewDto {
    fn from(review: ReviewEntity) -> Self {
        ReviewDto {
            id: review.id,
            user_id: review.user_id,
            rating: review.rating,
            comment: review.comment,
            review_date: review.review_date,
        }
    }
}

/// Average (2 dp) and count over the full set of ratings. Always derived from
/// scratch: resubmissions overwrite earlier ratings, so delta maintenance
/// against the previous aggregate would drift.
fn rating_aggregate(ratings: &[i32]) -> (Option<f64>, i32) {
    if ratings.is_empty() {
        return (None, 0);
    }
    let sum: i32 = ratings.iter().sum();
    let mean = f64::from(sum) / ratings.len() as f64;
    (Some(pricing::round2(mean)), ratings.len() as i32)
}

#[derive(Deserialize, ToSchema)]
struct CreateReviewReq {
    pub rating: i32,
    pub comment: Option<String>,
}

/// Submit a review for a product. One review per customer and product: a
/// resubmission overwrites the earlier rating, comment and date.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Reviews"],
    params(
        ("product_id" = i32, Path, description = "Product to review")
    ),
    request_body = CreateReviewReq,
    responses(
        (status = 200, description = "Review stored, product aggregate updated", body = StdResponse<ReviewDto, String>)
    )
)]
async fn submit_review(
    Path(product_id): Path<i32>,
    State(state): State<AppState>,
    Extension(owner_id): Extension<String>,
    Json(body): Json<CreateReviewReq>,
) -> Result<impl IntoResponse, AppError> {
    if !(1..=5).contains(&body.rating) {
        return Err(AppError::BadRequest(
            "Rating must be between 1 and 5".into(),
        ));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let review = conn
        .transaction(move |conn| {
            Box::pin(async move {
                // The product row lock serializes concurrent submissions for
                // the same product, so both recomputes land in order. It also
                // doubles as the existence check.
                catalog::get_product_for_update(conn, product_id).await?;

                let review: ReviewEntity = diesel::insert_into(reviews::table)
                    .values(CreateReviewEntity {
                        product_id,
                        user_id: owner_id.clone(),
                        rating: body.rating,
                        comment: body.comment.clone(),
                    })
                    .on_conflict((reviews::product_id, reviews::user_id))
                    .do_update()
                    .set((
                        reviews::rating.eq(body.rating),
                        reviews::comment.eq(body.comment.clone()),
                        reviews::review_date.eq(diesel::dsl::now),
                    ))
                    .returning(ReviewEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to upsert review")?;

                let ratings: Vec<i32> = reviews::table
                    .filter(reviews::product_id.eq(product_id))
                    .select(reviews::rating)
                    .get_results(conn)
                    .await
                    .context("Failed to load ratings for recompute")?;

                let (average_rating, review_count) = rating_aggregate(&ratings);
                catalog::update_rating_aggregate(conn, product_id, average_rating, review_count)
                    .await?;

                Ok::<ReviewEntity, AppError>(review)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(ReviewDto::from(review)),
        message: Some("Review submitted successfully"),
    })
}

/// Fetch all reviews for a product, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Reviews"],
    params(
        ("product_id" = i32, Path, description = "Product to list reviews for")
    ),
    responses(
        (status = 200, description = "List product reviews", body = StdResponse<Vec<ReviewDto>, String>)
    )
)]
async fn get_reviews(
    Path(product_id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    catalog::get_product(conn, product_id).await?;

    let reviews: Vec<ReviewEntity> = reviews::table
        .filter(reviews::product_id.eq(product_id))
        .order_by(reviews::review_date.desc())
        .select(ReviewEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get reviews")?;

    let reviews: Vec<ReviewDto> = reviews.into_iter().map(ReviewDto::from).collect();

    Ok(StdResponse {
        data: Some(reviews),
        message: Some("Get reviews successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_over_initial_reviews() {
        let (average, count) = rating_aggregate(&[5, 3, 4]);
        assert_eq!(average, Some(4.00));
        assert_eq!(count, 3);
    }

    #[test]
    fn new_reviewer_extends_the_set() {
        let (average, count) = rating_aggregate(&[5, 3, 4, 2]);
        assert_eq!(average, Some(3.50));
        assert_eq!(count, 4);
    }

    #[test]
    fn resubmission_replaces_not_appends() {
        // First reviewer changes 5 -> 1; the count stays at four rows.
        let (average, count) = rating_aggregate(&[1, 3, 4, 2]);
        assert_eq!(average, Some(2.50));
        assert_eq!(count, 4);
    }

    #[test]
    fn no_reviews_means_no_aggregate() {
        assert_eq!(rating_aggregate(&[]), (None, 0));
    }

    #[test]
    fn average_rounds_to_two_decimals() {
        let (average, _) = rating_aggregate(&[5, 5, 4]);
        assert_eq!(average, Some(4.67));
        let (average, _) = rating_aggregate(&[1, 1, 2]);
        assert_eq!(average, Some(1.33));
    }
}
