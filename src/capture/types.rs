//! 补全记录数据模型
//!
//! 所有字段都是显式的 Option 类型，外部 JSON 只在解析/入库边界归一化一次，
//! 聚合与关联阶段不再逐字段防御。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一次被观测到的请求/响应对
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionRecord {
    pub trace_id: String,
    pub captured_at_ms: i64,
    pub ui_origin: String,
    pub endpoint: String,
    pub request: Option<RequestInfo>,
    pub response: Option<ResponseInfo>,
    /// 由关联器写入（仅一次）
    pub chain_id: Option<String>,
    /// 由关联器写入（仅一次）
    pub turn_number: Option<u32>,
}

impl CompletionRecord {
    /// 记录对应的模型名：优先请求中的 model，其次响应中的 model
    pub fn model_name(&self) -> &str {
        let from_request = self
            .request
            .as_ref()
            .and_then(|r| r.model.as_deref())
            .filter(|m| !m.trim().is_empty());
        let from_response = self
            .response
            .as_ref()
            .and_then(|r| r.model.as_deref())
            .filter(|m| !m.trim().is_empty());
        from_request.or(from_response).unwrap_or("unknown")
    }

    /// 是否已被关联器盖章
    pub fn is_correlated(&self) -> bool {
        self.chain_id.is_some()
    }

    /// 写入关联字段，已写入过则拒绝并返回 false
    pub fn stamp_chain(&mut self, chain_id: String, turn_number: u32) -> bool {
        if self.is_correlated() {
            return false;
        }
        self.chain_id = Some(chain_id);
        self.turn_number = Some(turn_number);
        true
    }
}

// === 请求侧 ===

/// 请求侧元数据（在捕获边界计算一次）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestInfo {
    pub model: Option<String>,
    pub composition: MessageComposition,
    pub params: GenerationParams,
    pub runtime: Option<RuntimeContext>,
    /// 完整 messages 数组的内容哈希
    pub prompt_hash: Option<String>,
    /// 去除附件后的纯文本提示哈希
    pub text_prompt_hash: Option<String>,
    /// 脱敏结构骨架哈希（角色、内容类型、字节数）
    pub message_structure_hash: Option<String>,
    pub scenario_labels: ScenarioLabels,
}

/// 按字节统计的消息构成
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageComposition {
    pub messages_count: u32,
    pub system_count: u32,
    pub user_count: u32,
    pub assistant_count: u32,
    pub tool_count: u32,
    pub system_text_bytes: u64,
    pub user_text_bytes: u64,
    pub assistant_text_bytes: u64,
    pub tool_text_bytes: u64,
    pub image_parts: u32,
    pub image_bytes: u64,
    pub file_parts: u32,
    pub file_bytes: u64,
    /// 去重并排序后的文件类型（pdf、txt 等）
    pub file_kinds: Vec<String>,
}

impl MessageComposition {
    pub fn has_document(&self) -> bool {
        self.file_parts > 0
    }

    pub fn has_image(&self) -> bool {
        self.image_parts > 0
    }
}

/// 生成参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<f64>,
    pub min_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub seed: Option<i64>,
    pub stream: Option<bool>,
}

/// 推理服务运行时上下文（来自 /props）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeContext {
    pub n_ctx: Option<u64>,
    pub build_info: Option<String>,
    pub model_path: Option<String>,
}

/// 派生的场景分类标签
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioLabels {
    pub input_mode: String,
    pub file_size_bucket: String,
    pub file_kinds: String,
    pub image_size_bucket: String,
    pub image_count_bucket: String,
    pub user_text_size_bucket: String,
    pub runtime_bucket: String,
}

impl Default for ScenarioLabels {
    fn default() -> Self {
        let unknown = || "unknown".to_string();
        Self {
            input_mode: unknown(),
            file_size_bucket: unknown(),
            file_kinds: unknown(),
            image_size_bucket: unknown(),
            image_count_bucket: unknown(),
            user_text_size_bucket: unknown(),
            runtime_bucket: unknown(),
        }
    }
}

// === 响应侧 ===

/// 响应侧数据（由流解析器产生）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseInfo {
    pub id: Option<String>,
    pub created: Option<i64>,
    pub model: Option<String>,
    pub system_fingerprint: Option<String>,
    pub timings: Timings,
    pub derived: DerivedSplit,
    pub client_timing: ClientTiming,
    pub finish_reason: Option<String>,
    pub stop_reason_category: StopReasonCategory,
    pub output_tokens_estimate: u64,
    pub output_chars_estimate: u64,
    pub output_length_bucket: String,
    pub content_text: String,
    pub reasoning_text: String,
    pub text_truncated: bool,
}

/// 服务端 timings 对象
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub cache_n: Option<u64>,
    pub prompt_n: Option<u64>,
    pub prompt_ms: Option<f64>,
    pub predicted_n: Option<u64>,
    pub predicted_ms: Option<f64>,
    pub prompt_per_second: Option<f64>,
    pub predicted_per_second: Option<f64>,
}

impl Timings {
    /// 从 chunk 中的 timings 对象宽松解析，非数值或非有限值一律置空
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let count = |key: &str| {
            obj.get(key)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v.round() as u64)
        };
        let float = |key: &str| {
            obj.get(key)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
        };
        Some(Self {
            cache_n: count("cache_n"),
            prompt_n: count("prompt_n"),
            prompt_ms: float("prompt_ms"),
            predicted_n: count("predicted_n"),
            predicted_ms: float("predicted_ms"),
            prompt_per_second: float("prompt_per_second"),
            predicted_per_second: float("predicted_per_second"),
        })
    }
}

/// 思考/回答的 token 与耗时拆分
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedSplit {
    pub reasoning_n: u64,
    pub reasoning_ms: f64,
    pub content_n: u64,
    pub content_ms: f64,
    pub reasoning_per_second: Option<f64>,
    pub content_per_second: Option<f64>,
    pub reasoning_observed: bool,
}

/// 客户端墙钟时间点及两两差值（毫秒）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTiming {
    pub request_start_ms: Option<i64>,
    pub headers_ms: Option<i64>,
    pub first_chunk_ms: Option<i64>,
    pub stop_ms: Option<i64>,
    pub request_to_headers_ms: Option<i64>,
    pub request_to_first_chunk_ms: Option<i64>,
    pub request_to_stop_ms: Option<i64>,
    pub headers_to_first_chunk_ms: Option<i64>,
    pub headers_to_stop_ms: Option<i64>,
    pub first_chunk_to_stop_ms: Option<i64>,
}

impl ClientTiming {
    /// 由四个时间点计算六个差值；任一端点缺失则对应差值为 None
    pub fn from_marks(
        request_start_ms: Option<i64>,
        headers_ms: Option<i64>,
        first_chunk_ms: Option<i64>,
        stop_ms: Option<i64>,
    ) -> Self {
        fn delta(earlier: Option<i64>, later: Option<i64>) -> Option<i64> {
            Some((later? - earlier?).max(0))
        }
        Self {
            request_start_ms,
            headers_ms,
            first_chunk_ms,
            stop_ms,
            request_to_headers_ms: delta(request_start_ms, headers_ms),
            request_to_first_chunk_ms: delta(request_start_ms, first_chunk_ms),
            request_to_stop_ms: delta(request_start_ms, stop_ms),
            headers_to_first_chunk_ms: delta(headers_ms, first_chunk_ms),
            headers_to_stop_ms: delta(headers_ms, stop_ms),
            first_chunk_to_stop_ms: delta(first_chunk_ms, stop_ms),
        }
    }
}

/// 归一化的停止原因
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReasonCategory {
    Completed,
    TruncatedLength,
    Filtered,
    ToolCalls,
    #[default]
    Unknown,
    Other,
}

impl StopReasonCategory {
    pub fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason.map(str::trim) {
            None | Some("") => Self::Unknown,
            Some("stop") => Self::Completed,
            Some("length") => Self::TruncatedLength,
            Some("content_filter") => Self::Filtered,
            Some("tool_calls") => Self::ToolCalls,
            Some(_) => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TruncatedLength => "truncated_length",
            Self::Filtered => "filtered",
            Self::ToolCalls => "tool_calls",
            Self::Unknown => "unknown",
            Self::Other => "other",
        }
    }
}
