pub mod ai;
pub mod distributed;
pub mod knowledge;
pub mod points;
pub mod search;
pub mod worker;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/ai", ai::router())
        .nest("/knowledge-bases", knowledge::router())
        .nest("/search", search::router())
        .nest("/distributed", distributed::router())
        .nest("/users/me", points::router())
        .nest("/api/worker", worker::router())
        .with_state(state)
}
