//! 记录与统计 API 处理器

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

use super::router::RecordApiState;
use super::types::RecordQuery;

pub(super) fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {"type": error_type, "message": message}
        })),
    )
        .into_response()
}

fn internal_error(action: &str, e: anyhow::Error) -> Response {
    tracing::error!("{}失败: {}", action, e);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        format!("{}失败: {}", action, e),
    )
}

/// GET /api/admin/records
pub async fn get_records(
    State(state): State<RecordApiState>,
    Query(query): Query<RecordQuery>,
) -> Response {
    if let (Some(since), Some(until)) = (query.since_ms, query.until_ms) {
        if since > until {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("sinceMs ({}) 不能晚于 untilMs ({})", since, until),
            );
        }
    }
    match state.sink.query(query).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => internal_error("查询补全记录", e),
    }
}

/// DELETE /api/admin/records 查询参数
#[derive(Deserialize)]
pub struct ClearRecordsQuery {
    /// 毫秒时间戳，早于该时间的记录被删除
    pub before: Option<i64>,
}

/// DELETE /api/admin/records
pub async fn clear_records(
    State(state): State<RecordApiState>,
    Query(query): Query<ClearRecordsQuery>,
) -> Response {
    match state.sink.clear(query.before).await {
        Ok(count) => Json(serde_json::json!({
            "success": true,
            "message": format!("已清除 {} 条记录", count)
        }))
        .into_response(),
        Err(e) => internal_error("清除补全记录", e),
    }
}

/// GET /api/admin/stats/dashboard
pub async fn get_dashboard(State(state): State<RecordApiState>) -> Response {
    match state.sink.dashboard().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error("计算概览统计", e),
    }
}

#[derive(Deserialize)]
pub struct ScenarioQuery {
    pub model: Option<String>,
}

/// GET /api/admin/stats/scenarios
pub async fn get_scenarios(
    State(state): State<RecordApiState>,
    Query(query): Query<ScenarioQuery>,
) -> Response {
    match state.sink.scenarios(query.model).await {
        Ok(comparison) => Json(comparison).into_response(),
        Err(e) => internal_error("计算场景对比", e),
    }
}

/// DELETE /api/admin/contexts/{id}
pub async fn forget_context(
    State(state): State<RecordApiState>,
    Path(context_id): Path<String>,
) -> Response {
    state.sink.forget_context(context_id.as_str());
    Json(serde_json::json!({
        "success": true,
        "message": format!("上下文 {} 的会话链状态将被清除", context_id)
    }))
    .into_response()
}
