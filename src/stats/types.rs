//! 聚合输出结构
//!
//! 存储层与渲染层只依赖这些结构，字段名即对外的稳定契约。

use serde::Serialize;

// === 概览 ===

/// 概览统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub summary: SummaryStats,
    pub models: Vec<ModelStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryStats {
    pub total_completions: u64,
    pub distinct_models: u64,
    pub avg_predicted_per_second: Option<f64>,
    pub avg_prompt_ms: Option<f64>,
    pub avg_cache_n: Option<f64>,
    pub last_seen_ms: Option<i64>,
    pub document_attached_requests_pct: f64,
    pub image_attached_requests_pct: f64,
}

/// 单个模型的统计行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub completions: u64,
    pub avg_predicted_per_second: Option<f64>,
    pub avg_prompt_ms: Option<f64>,
    pub avg_cache_n: Option<f64>,
    pub last_seen_ms: Option<i64>,
    pub doc_request_pct: f64,
    pub image_request_pct: f64,
}

// === 场景对比 ===

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioComparison {
    pub selected_model: Option<String>,
    pub model_options: Vec<ModelOption>,
    pub breakdowns: Breakdowns,
    pub comparisons: Comparisons,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelOption {
    pub model: String,
    pub completions: u64,
}

/// 九个分类维度
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Breakdowns {
    pub input_mode: Vec<BucketStats>,
    pub file_size: Vec<BucketStats>,
    pub file_kinds: Vec<BucketStats>,
    pub image_size: Vec<BucketStats>,
    pub image_count: Vec<BucketStats>,
    pub user_text_size: Vec<BucketStats>,
    pub runtime: Vec<BucketStats>,
    pub stop_reason: Vec<BucketStats>,
    pub output_length: Vec<BucketStats>,
}

/// 单个分类标签的统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketStats {
    pub label: String,
    pub count: u64,
    pub avg_predicted_per_second: Option<f64>,
    pub avg_prompt_per_second: Option<f64>,
    pub avg_prompt_ms: Option<f64>,
    pub avg_cache_n: Option<f64>,
    pub avg_ttft_ms: Option<f64>,
    /// 仅输出长度维度填充
    pub ms_per_1k_output_tokens: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparisons {
    pub file_vs_text: Vec<FileVsTextRow>,
    pub prompt_hash_controls: Vec<PromptHashControl>,
}

/// 文件附件与纯文本对比行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileVsTextRow {
    pub trace_id: String,
    pub captured_at_ms: i64,
    pub input_mode: String,
    pub file_bytes: u64,
    pub file_kinds: String,
    pub user_text_bytes: u64,
    pub prompt_n: Option<u64>,
    pub prompt_ms: Option<f64>,
    pub prompt_per_second: Option<f64>,
    pub predicted_per_second: Option<f64>,
}

/// 相同提示在不同输入模式下的对照组
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptHashControl {
    pub prompt_hash: String,
    pub completions: u64,
    pub modes: Vec<ControlModeStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlModeStats {
    pub input_mode: String,
    pub count: u64,
    pub avg_prompt_ms: Option<f64>,
    pub avg_prompt_per_second: Option<f64>,
    pub avg_predicted_per_second: Option<f64>,
}
