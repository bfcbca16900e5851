//! 聚合累加器
//!
//! 每次聚合调用都从完整记录集重建，从不持久化。

use crate::capture::types::{CompletionRecord, RequestInfo, ResponseInfo};

/// 保留两位小数，非有限值返回 None
pub fn round2(value: f64) -> Option<f64> {
    value.is_finite().then(|| (value * 100.0).round() / 100.0)
}

/// 百分比，分母为 0 时为 0，结果限制在 [0, 100]
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / whole as f64)
        .unwrap_or(0.0)
        .clamp(0.0, 100.0)
}

/// 只累计有限值的均值
///
/// 求和前按数值排序，浮点结果与样本到达顺序无关
#[derive(Debug, Clone, Default)]
pub struct Mean {
    values: Vec<f64>,
}

impl Mean {
    pub fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.values.push(v);
        }
    }

    pub fn sum(&self) -> f64 {
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        sorted.iter().sum()
    }

    /// 没有样本时为 None
    pub fn value(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        round2(self.sum() / self.values.len() as f64)
    }
}

/// 请求和响应都存在的记录视图
#[derive(Debug, Clone, Copy)]
pub struct Observed<'a> {
    pub record: &'a CompletionRecord,
    pub request: &'a RequestInfo,
    pub response: &'a ResponseInfo,
}

/// 过滤掉缺少请求或响应的记录
pub fn observed(records: &[CompletionRecord]) -> Vec<Observed<'_>> {
    records
        .iter()
        .filter_map(|record| {
            Some(Observed {
                record,
                request: record.request.as_ref()?,
                response: record.response.as_ref()?,
            })
        })
        .collect()
}

/// 按分类标签累计的指标
#[derive(Debug, Clone, Default)]
pub struct ScenarioBucket {
    pub count: u64,
    pub predicted_per_second: Mean,
    pub prompt_per_second: Mean,
    pub prompt_ms: Mean,
    pub cache_n: Mean,
    pub ttft_ms: Mean,
    predicted_ms: Mean,
    predicted_n_sum: u64,
    pub last_seen_ms: Option<i64>,
    pub document_requests: u64,
    pub image_requests: u64,
}

impl ScenarioBucket {
    pub fn add(&mut self, item: &Observed<'_>) {
        let timings = &item.response.timings;
        self.count += 1;
        self.predicted_per_second.add(timings.predicted_per_second);
        self.prompt_per_second.add(timings.prompt_per_second);
        self.prompt_ms.add(timings.prompt_ms);
        self.cache_n.add(timings.cache_n.map(|n| n as f64));
        self.ttft_ms.add(
            item.response
                .client_timing
                .request_to_first_chunk_ms
                .map(|ms| ms as f64),
        );

        if let (Some(n), Some(ms)) = (timings.predicted_n, timings.predicted_ms) {
            if n > 0 && ms.is_finite() && ms >= 0.0 {
                self.predicted_n_sum += n;
                self.predicted_ms.add(Some(ms));
            }
        }

        let seen = item.record.captured_at_ms;
        self.last_seen_ms = Some(self.last_seen_ms.map_or(seen, |prev| prev.max(seen)));

        if item.request.composition.has_document() {
            self.document_requests += 1;
        }
        if item.request.composition.has_image() {
            self.image_requests += 1;
        }
    }

    /// 每生成 1000 个输出 token 的耗时（毫秒）
    pub fn ms_per_1k_output_tokens(&self) -> Option<f64> {
        if self.predicted_n_sum == 0 {
            return None;
        }
        round2(self.predicted_ms.sum() / self.predicted_n_sum as f64 * 1000.0)
    }

    pub fn document_pct(&self) -> f64 {
        percentage(self.document_requests, self.count)
    }

    pub fn image_pct(&self) -> f64 {
        percentage(self.image_requests, self.count)
    }
}
