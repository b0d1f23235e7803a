use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use mentora_schema::{Achievement, PointTransaction, UserAchievement};
use mentora_store::UserRepo;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/points/history", get(point_history))
        .route("/achievements", get(achievements))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn point_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<PointTransaction>>> {
    let limit = page.limit.unwrap_or(50).clamp(1, 200);
    let offset = page.offset.unwrap_or(0).max(0);
    let history = UserRepo::new(state.db.clone())
        .point_history(user_id, limit, offset)
        .await?;
    Ok(Json(history))
}

#[derive(Serialize)]
struct EarnedAchievement {
    #[serde(flatten)]
    grant: UserAchievement,
    achievement: Achievement,
}

/// Earned achievements, each joined with its definition.
async fn achievements(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Vec<EarnedAchievement>>> {
    let earned = UserRepo::new(state.db.clone())
        .earned_achievements(user_id)
        .await?;
    Ok(Json(
        earned
            .into_iter()
            .map(|(grant, achievement)| EarnedAchievement { grant, achievement })
            .collect(),
    ))
}
