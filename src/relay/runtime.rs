//! 推理服务运行时上下文探测
//!
//! 读取上游 `/props`，结果按 TTL 缓存；探测失败时返回 None 并同样缓存，
//! 避免每次请求都打到一个不支持该端点的上游。

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;

use crate::capture::types::RuntimeContext;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RuntimeProbe {
    client: Client,
    url: String,
    enabled: bool,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Option<RuntimeContext>)>>,
}

impl RuntimeProbe {
    pub fn new(client: Client, upstream_base: &str, enabled: bool, ttl_secs: u64) -> Self {
        Self {
            client,
            url: format!("{}/props", upstream_base.trim_end_matches('/')),
            enabled,
            ttl: Duration::from_secs(ttl_secs),
            cache: Mutex::new(None),
        }
    }

    /// 当前运行时上下文（可能来自缓存）
    pub async fn get(&self) -> Option<RuntimeContext> {
        if !self.enabled {
            return None;
        }
        let cached = self
            .cache
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, context)| context.clone());
        if let Some(context) = cached {
            return context;
        }

        let fresh = self.fetch().await;
        *self.cache.lock() = Some((Instant::now(), fresh.clone()));
        fresh
    }

    async fn fetch(&self) -> Option<RuntimeContext> {
        let result = async {
            let value: Value = self
                .client
                .get(&self.url)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<_, reqwest::Error>(value)
        }
        .await;

        match result {
            Ok(value) => parse_props(&value),
            Err(e) => {
                tracing::debug!("读取运行时上下文失败: {}", e);
                None
            }
        }
    }
}

/// 从 `/props` 响应中提取运行时上下文，三项都缺失时返回 None
pub fn parse_props(value: &Value) -> Option<RuntimeContext> {
    let n_ctx = value
        .pointer("/default_generation_settings/n_ctx")
        .or_else(|| value.get("n_ctx"))
        .and_then(Value::as_u64)
        .filter(|n| *n > 0);
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let context = RuntimeContext {
        n_ctx,
        build_info: text("build_info"),
        model_path: text("model_path"),
    };
    (context.n_ctx.is_some() || context.build_info.is_some() || context.model_path.is_some())
        .then_some(context)
}
