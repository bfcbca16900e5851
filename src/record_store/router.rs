//! 记录与统计 API 路由

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get},
};

use crate::common::auth;

use super::handlers::{
    clear_records, error_response, forget_context, get_dashboard, get_records, get_scenarios,
};
use super::sink::RecordSink;

/// API 状态
#[derive(Clone)]
pub struct RecordApiState {
    pub sink: Arc<RecordSink>,
}

/// 管理密钥，只由认证层持有
#[derive(Clone)]
struct AdminKey(Arc<str>);

/// 认证中间件：`x-api-key` 或 `Authorization: Bearer`
async fn require_admin_key(
    State(AdminKey(expected)): State<AdminKey>,
    request: Request,
    next: Next,
) -> Response {
    let message = match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, &expected) => return next.run(request).await,
        Some(_) => "Invalid API key",
        None => "Missing API key",
    };
    tracing::warn!(
        method = %request.method(),
        path = %request.uri().path(),
        "Admin API 认证失败: {}",
        message
    );
    error_response(
        StatusCode::UNAUTHORIZED,
        "authentication_error",
        message.to_string(),
    )
}

/// 创建记录 API 路由，挂载到 `/api/admin` 下
pub fn create_record_router(admin_api_key: impl Into<String>, sink: Arc<RecordSink>) -> Router {
    let key = AdminKey(Arc::from(admin_api_key.into()));

    Router::new()
        .route("/records", get(get_records).delete(clear_records))
        .route("/stats/dashboard", get(get_dashboard))
        .route("/stats/scenarios", get(get_scenarios))
        .route("/contexts/{id}", delete(forget_context))
        .with_state(RecordApiState { sink })
        .layer(middleware::from_fn_with_state(key, require_admin_key))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tokio::net::TcpListener;

    use super::*;
    use crate::chain::CorrelatorConfig;
    use crate::record_store::store::RecordStore;

    async fn serve_admin() -> String {
        let sink = Arc::new(RecordSink::with_store(
            RecordStore::open_in_memory().unwrap(),
            CorrelatorConfig::default(),
        ));
        let app = Router::new().nest("/api/admin", create_record_router("secret", sink));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/admin", addr)
    }

    #[tokio::test]
    async fn test_rejects_missing_and_wrong_key() {
        let base = serve_admin().await;
        let client = reqwest::Client::new();

        let missing = client.get(format!("{}/records", base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::UNAUTHORIZED);
        let body: Value = missing.json().await.unwrap();
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["message"], "Missing API key");

        let wrong = client
            .get(format!("{}/stats/dashboard", base))
            .header("x-api-key", "guess")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);
        let body: Value = wrong.json().await.unwrap();
        assert_eq!(body["error"]["message"], "Invalid API key");
    }

    /// 两种携带方式都能通过认证并到达处理器
    #[tokio::test]
    async fn test_accepts_header_and_bearer_key() {
        let base = serve_admin().await;
        let client = reqwest::Client::new();

        let listed: Value = client
            .get(format!("{}/records?pageSize=5", base))
            .header("x-api-key", "secret")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["total"], 0);

        let forgotten = client
            .delete(format!("{}/contexts/tab-1", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert!(forgotten.status().is_success());
    }
}
