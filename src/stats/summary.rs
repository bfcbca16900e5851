//! 概览聚合：全局与按模型的统计

use std::cmp::Ordering;
use std::collections::HashMap;

use super::accumulator::{ScenarioBucket, observed};
use super::types::{DashboardStats, ModelStats, SummaryStats};
use crate::capture::types::CompletionRecord;

/// 计算概览统计
///
/// 只统计请求和响应都存在的记录；结果与输入顺序无关
pub fn dashboard_stats(records: &[CompletionRecord]) -> DashboardStats {
    let items = observed(records);

    let mut global = ScenarioBucket::default();
    let mut per_model: HashMap<&str, ScenarioBucket> = HashMap::new();
    for item in &items {
        global.add(item);
        per_model
            .entry(item.record.model_name())
            .or_default()
            .add(item);
    }

    let mut models: Vec<ModelStats> = per_model
        .into_iter()
        .map(|(model, bucket)| ModelStats {
            model: model.to_string(),
            completions: bucket.count,
            avg_predicted_per_second: bucket.predicted_per_second.value(),
            avg_prompt_ms: bucket.prompt_ms.value(),
            avg_cache_n: bucket.cache_n.value(),
            last_seen_ms: bucket.last_seen_ms,
            doc_request_pct: bucket.document_pct(),
            image_request_pct: bucket.image_pct(),
        })
        .collect();
    models.sort_by(compare_models);

    DashboardStats {
        summary: SummaryStats {
            total_completions: global.count,
            distinct_models: models.len() as u64,
            avg_predicted_per_second: global.predicted_per_second.value(),
            avg_prompt_ms: global.prompt_ms.value(),
            avg_cache_n: global.cache_n.value(),
            last_seen_ms: global.last_seen_ms,
            document_attached_requests_pct: global.document_pct(),
            image_attached_requests_pct: global.image_pct(),
        },
        models,
    }
}

/// 按补全数降序，其次平均生成速度降序，最后按名称
fn compare_models(a: &ModelStats, b: &ModelStats) -> Ordering {
    b.completions
        .cmp(&a.completions)
        .then_with(|| {
            let speed = |m: &ModelStats| m.avg_predicted_per_second.unwrap_or(f64::NEG_INFINITY);
            speed(b).total_cmp(&speed(a))
        })
        .then_with(|| a.model.cmp(&b.model))
}
