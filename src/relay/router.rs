//! 转发服务路由

use axum::{Router, routing::post};

use super::handlers::{CHAT_COMPLETIONS_PATH, RelayState, chat_completions};

/// 创建转发路由
pub fn create_relay_router(state: RelayState) -> Router {
    Router::new()
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .with_state(state)
}

/// CORS 中间件层
///
/// 浏览器 UI 直接访问转发服务，允许任意来源、方法和请求头
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
