//! 记录查询 API 请求/响应类型

use serde::{Deserialize, Serialize};

use crate::capture::types::CompletionRecord;

/// 查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub context_id: Option<String>,
    pub model: Option<String>,
    /// 含下界（毫秒时间戳）
    pub since_ms: Option<i64>,
    /// 含上界（毫秒时间戳）
    pub until_ms: Option<i64>,
}

/// 分页响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordListResponse {
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub records: Vec<StoredRecord>,
}

/// 单条已入库记录
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: i64,
    pub context_id: String,
    pub record: CompletionRecord,
}

/// 待写入的记录（已完成关联）
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub context_id: String,
    pub record: CompletionRecord,
}
