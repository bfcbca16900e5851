//! Chat completion 转发处理器
//!
//! 请求原样转发到上游；SSE 响应在转发的同时把每个分片复制进
//! channel，交给独立的解析任务，转发路径本身不等待解析。

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::runtime::RuntimeProbe;
use crate::capture::{CaptureContext, ParserConfig, StreamChunk, analyze_request, parse_stream};
use crate::common::now_ms;
use crate::record_store::RecordSink;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// 转发给上游的请求头
const FORWARDED_REQUEST_HEADERS: &[&str] = &["authorization", "content-type", "accept"];

/// 回传给调用方的响应头
const FORWARDED_RESPONSE_HEADERS: &[&str] = &["content-type", "cache-control"];

/// 转发服务状态
#[derive(Clone)]
pub struct RelayState {
    pub client: reqwest::Client,
    pub upstream_base: String,
    pub capture_enabled: bool,
    pub parser_config: ParserConfig,
    pub sink: Arc<RecordSink>,
    pub runtime: Arc<RuntimeProbe>,
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = format!("{}{}", state.upstream_base, CHAT_COMPLETIONS_PATH);
    let mut request = state.client.post(&url).body(body.clone());
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = headers.get(*name) {
            request = request.header(*name, value.clone());
        }
    }

    let request_start_ms = now_ms();
    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("上游请求失败: {}", e);
            return (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": {"type": "upstream_error", "message": format!("上游请求失败: {}", e)}
                })),
            )
                .into_response();
        }
    };
    let headers_ms = now_ms();

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for name in FORWARDED_RESPONSE_HEADERS {
        if let Some(value) = upstream.headers().get(*name) {
            response_headers.insert(*name, value.clone());
        }
    }

    let payload = if state.capture_enabled
        && status.is_success()
        && is_event_stream(upstream.headers())
    {
        serde_json::from_slice::<Value>(&body).ok()
    } else {
        None
    };

    let body = match payload {
        Some(payload) => {
            let (tx, rx) = mpsc::unbounded_channel::<StreamChunk>();
            let trace_id = Uuid::new_v4().to_string();
            tracing::debug!(trace_id = %trace_id, "开始捕获 SSE 响应");

            let capture = CaptureJob {
                trace_id,
                context_id: context_id(&headers),
                ui_origin: ui_origin(&headers),
                payload,
                request_start_ms,
                headers_ms,
            };
            tokio::spawn(capture.run(rx, state.clone()));

            // 在复制处打上到达时间；发送端随响应体一起释放，解析任务因此读到 EOF
            let stream = upstream.bytes_stream().map(move |chunk| {
                if let Ok(bytes) = &chunk {
                    let _ = tx.send(StreamChunk::new(bytes.clone()));
                }
                chunk
            });
            Body::from_stream(stream)
        }
        None => Body::from_stream(upstream.bytes_stream()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// 一次 SSE 响应的后台捕获任务
struct CaptureJob {
    trace_id: String,
    context_id: String,
    ui_origin: String,
    payload: Value,
    request_start_ms: i64,
    headers_ms: i64,
}

impl CaptureJob {
    async fn run(self, rx: mpsc::UnboundedReceiver<StreamChunk>, state: RelayState) {
        let runtime = state.runtime.get().await;
        let ctx = CaptureContext {
            trace_id: self.trace_id,
            ui_origin: self.ui_origin,
            endpoint: CHAT_COMPLETIONS_PATH.to_string(),
            request: analyze_request(&self.payload, runtime),
            request_start_ms: Some(self.request_start_ms),
            headers_ms: Some(self.headers_ms),
        };

        if let Some(record) = parse_stream(rx, ctx, state.parser_config).await {
            tracing::info!(
                trace_id = %record.trace_id,
                context_id = %self.context_id,
                model = record.model_name(),
                "捕获补全记录"
            );
            state.sink.record(self.context_id, record);
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// 上下文标识：`x-capture-context`，其次 `x-session-id`，否则 `default`
pub fn context_id(headers: &HeaderMap) -> String {
    header_str(headers, "x-capture-context")
        .or_else(|| header_str(headers, "x-session-id"))
        .unwrap_or("default")
        .to_string()
}

/// UI 来源：`origin`，其次 `referer`，否则 `unknown`
pub fn ui_origin(headers: &HeaderMap) -> String {
    header_str(headers, "origin")
        .or_else(|| header_str(headers, "referer"))
        .unwrap_or("unknown")
        .to_string()
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/event-stream"))
}
