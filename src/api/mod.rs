/// API routes and handlers
pub mod extract;
pub mod health;
pub mod middleware;
pub mod users;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(users::routes(ctx))
}
