use crate::aliases::DbPool;

/// Shared per-process state handed to every handler. The pool hands out one
/// connection per request; transaction scope never outlives a handler.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
}
