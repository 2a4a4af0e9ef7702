use axum::{extract::Request, middleware::Next, response::Response};

use crate::app_error::AppError;

/// Header the upstream identity gateway uses to assert the authenticated
/// customer id. The service never authenticates, it only trusts this value.
pub const OWNER_ID_HEADER: &str = "x-user-id";

pub async fn customers_authorization(
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let owner_id = request
        .headers()
        .get(OWNER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned);

    match owner_id {
        Some(owner_id) => {
            request.extensions_mut().insert(owner_id);
            Ok(next.run(request).await)
        }
        None => Err(AppError::Unauthorized(format!(
            "Missing {OWNER_ID_HEADER} header"
        ))),
    }
}
