//! 场景对比聚合
//!
//! 九个分类维度由 [`DIMENSIONS`] 声明，统一经过 [`group_by`] 分组，
//! 新增维度只需要在表中加一行。

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::accumulator::{Mean, Observed, ScenarioBucket, observed};
use super::types::{
    BucketStats, Breakdowns, Comparisons, ControlModeStats, FileVsTextRow, ModelOption,
    PromptHashControl, ScenarioComparison,
};
use crate::capture::request::output_length_bucket;
use crate::capture::types::CompletionRecord;

/// 文件/文本对比表的最大行数
const FILE_VS_TEXT_LIMIT: usize = 50;

/// 分组结果的排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortPolicy {
    /// 数量降序，标签升序
    ByCount,
    /// 有序标签（带数字前缀），按标签升序
    ByLabel,
}

/// 一个分类维度
struct Dimension {
    key: fn(&Observed<'_>) -> String,
    sort: SortPolicy,
    slot: fn(&mut Breakdowns) -> &mut Vec<BucketStats>,
    with_ms_per_1k: bool,
}

const DIMENSIONS: &[Dimension] = &[
    Dimension {
        key: |o| o.request.scenario_labels.input_mode.clone(),
        sort: SortPolicy::ByCount,
        slot: |b| &mut b.input_mode,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| o.request.scenario_labels.file_size_bucket.clone(),
        sort: SortPolicy::ByLabel,
        slot: |b| &mut b.file_size,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| o.request.scenario_labels.file_kinds.clone(),
        sort: SortPolicy::ByCount,
        slot: |b| &mut b.file_kinds,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| o.request.scenario_labels.image_size_bucket.clone(),
        sort: SortPolicy::ByLabel,
        slot: |b| &mut b.image_size,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| o.request.scenario_labels.image_count_bucket.clone(),
        sort: SortPolicy::ByCount,
        slot: |b| &mut b.image_count,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| o.request.scenario_labels.user_text_size_bucket.clone(),
        sort: SortPolicy::ByLabel,
        slot: |b| &mut b.user_text_size,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| o.request.scenario_labels.runtime_bucket.clone(),
        sort: SortPolicy::ByCount,
        slot: |b| &mut b.runtime,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| o.response.stop_reason_category.as_str().to_string(),
        sort: SortPolicy::ByCount,
        slot: |b| &mut b.stop_reason,
        with_ms_per_1k: false,
    },
    Dimension {
        key: |o| output_length_bucket(o.response.output_tokens_estimate).to_string(),
        sort: SortPolicy::ByCount,
        slot: |b| &mut b.output_length,
        with_ms_per_1k: true,
    },
];

/// 计算场景对比
///
/// `selected_model` 缺失或不存在时回退到补全数最多的模型
pub fn scenario_comparison(
    records: &[CompletionRecord],
    selected_model: Option<&str>,
) -> ScenarioComparison {
    let items = observed(records);
    let model_options = model_options(&items);

    let selected = selected_model
        .map(str::trim)
        .filter(|m| model_options.iter().any(|o| o.model == *m))
        .map(str::to_string)
        .or_else(|| model_options.first().map(|o| o.model.clone()));

    let filtered: Vec<Observed<'_>> = match selected.as_deref() {
        Some(model) => items
            .into_iter()
            .filter(|o| o.record.model_name() == model)
            .collect(),
        None => Vec::new(),
    };

    let mut breakdowns = Breakdowns::default();
    for dimension in DIMENSIONS {
        *(dimension.slot)(&mut breakdowns) = group_by(&filtered, dimension);
    }

    ScenarioComparison {
        selected_model: selected,
        model_options,
        breakdowns,
        comparisons: Comparisons {
            file_vs_text: file_vs_text(&filtered),
            prompt_hash_controls: prompt_hash_controls(&filtered),
        },
    }
}

fn model_options(items: &[Observed<'_>]) -> Vec<ModelOption> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for item in items {
        *counts.entry(item.record.model_name()).or_default() += 1;
    }
    let mut options: Vec<ModelOption> = counts
        .into_iter()
        .map(|(model, completions)| ModelOption {
            model: model.to_string(),
            completions,
        })
        .collect();
    options.sort_by(|a, b| {
        b.completions
            .cmp(&a.completions)
            .then_with(|| a.model.cmp(&b.model))
    });
    options
}

fn group_by(items: &[Observed<'_>], dimension: &Dimension) -> Vec<BucketStats> {
    let mut groups: HashMap<String, ScenarioBucket> = HashMap::new();
    for item in items {
        let label = (dimension.key)(item);
        let label = if label.trim().is_empty() {
            "unknown".to_string()
        } else {
            label
        };
        groups.entry(label).or_default().add(item);
    }

    let mut rows: Vec<BucketStats> = groups
        .into_iter()
        .map(|(label, bucket)| BucketStats {
            label,
            count: bucket.count,
            avg_predicted_per_second: bucket.predicted_per_second.value(),
            avg_prompt_per_second: bucket.prompt_per_second.value(),
            avg_prompt_ms: bucket.prompt_ms.value(),
            avg_cache_n: bucket.cache_n.value(),
            avg_ttft_ms: bucket.ttft_ms.value(),
            ms_per_1k_output_tokens: if dimension.with_ms_per_1k {
                bucket.ms_per_1k_output_tokens()
            } else {
                None
            },
        })
        .collect();

    match dimension.sort {
        SortPolicy::ByCount => rows.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.label.cmp(&b.label))
        }),
        SortPolicy::ByLabel => rows.sort_by(|a, b| a.label.cmp(&b.label)),
    }
    rows
}

fn file_vs_text(items: &[Observed<'_>]) -> Vec<FileVsTextRow> {
    let mut rows: Vec<FileVsTextRow> = items
        .iter()
        .filter(|o| {
            let c = &o.request.composition;
            c.file_bytes > 0 || c.user_text_bytes > 0
        })
        .map(|o| {
            let c = &o.request.composition;
            let t = &o.response.timings;
            FileVsTextRow {
                trace_id: o.record.trace_id.clone(),
                captured_at_ms: o.record.captured_at_ms,
                input_mode: o.request.scenario_labels.input_mode.clone(),
                file_bytes: c.file_bytes,
                file_kinds: o.request.scenario_labels.file_kinds.clone(),
                user_text_bytes: c.user_text_bytes,
                prompt_n: t.prompt_n,
                prompt_ms: t.prompt_ms,
                prompt_per_second: t.prompt_per_second,
                predicted_per_second: t.predicted_per_second,
            }
        })
        .collect();

    rows.sort_by(compare_file_rows);
    rows.truncate(FILE_VS_TEXT_LIMIT);
    rows
}

fn compare_file_rows(a: &FileVsTextRow, b: &FileVsTextRow) -> Ordering {
    b.file_bytes
        .cmp(&a.file_bytes)
        .then_with(|| b.user_text_bytes.cmp(&a.user_text_bytes))
        .then_with(|| b.captured_at_ms.cmp(&a.captured_at_ms))
        .then_with(|| a.trace_id.cmp(&b.trace_id))
}

#[derive(Default)]
struct ModeAccumulator {
    count: u64,
    prompt_ms: Mean,
    prompt_per_second: Mean,
    predicted_per_second: Mean,
}

/// 相同提示跨越多种输入模式的对照组
///
/// 以去除附件后的文本哈希分组，缺失时退回完整哈希
fn prompt_hash_controls(items: &[Observed<'_>]) -> Vec<PromptHashControl> {
    let mut groups: HashMap<&str, BTreeMap<&str, ModeAccumulator>> = HashMap::new();
    for item in items {
        let Some(hash) = item
            .request
            .text_prompt_hash
            .as_deref()
            .or(item.request.prompt_hash.as_deref())
        else {
            continue;
        };
        let mode = item.request.scenario_labels.input_mode.as_str();
        let acc = groups.entry(hash).or_default().entry(mode).or_default();
        let t = &item.response.timings;
        acc.count += 1;
        acc.prompt_ms.add(t.prompt_ms);
        acc.prompt_per_second.add(t.prompt_per_second);
        acc.predicted_per_second.add(t.predicted_per_second);
    }

    let mut controls: Vec<PromptHashControl> = groups
        .into_iter()
        .filter(|(_, modes)| modes.len() > 1)
        .map(|(hash, modes)| PromptHashControl {
            prompt_hash: hash.to_string(),
            completions: modes.values().map(|m| m.count).sum(),
            modes: modes
                .into_iter()
                .map(|(mode, acc)| ControlModeStats {
                    input_mode: mode.to_string(),
                    count: acc.count,
                    avg_prompt_ms: acc.prompt_ms.value(),
                    avg_prompt_per_second: acc.prompt_per_second.value(),
                    avg_predicted_per_second: acc.predicted_per_second.value(),
                })
                .collect(),
        })
        .collect();

    controls.sort_by(|a, b| {
        b.completions
            .cmp(&a.completions)
            .then_with(|| a.prompt_hash.cmp(&b.prompt_hash))
    });
    controls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::{
        MessageComposition, RequestInfo, ResponseInfo, ScenarioLabels, StopReasonCategory, Timings,
    };

    struct Case<'a> {
        model: &'a str,
        mode: &'a str,
        file_bytes: u64,
        user_text_bytes: u64,
        file_bucket: &'a str,
        text_hash: &'a str,
        tokens: u64,
        tps: f64,
        at: i64,
    }

    fn record(case: Case<'_>) -> CompletionRecord {
        CompletionRecord {
            trace_id: format!("t-{}", case.at),
            captured_at_ms: case.at,
            request: Some(RequestInfo {
                model: Some(case.model.to_string()),
                composition: MessageComposition {
                    user_count: 1,
                    file_parts: (case.file_bytes > 0) as u32,
                    file_bytes: case.file_bytes,
                    user_text_bytes: case.user_text_bytes,
                    ..Default::default()
                },
                prompt_hash: Some(format!("full-{}", case.at)),
                text_prompt_hash: Some(case.text_hash.to_string()),
                scenario_labels: ScenarioLabels {
                    input_mode: case.mode.to_string(),
                    file_size_bucket: case.file_bucket.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            response: Some(ResponseInfo {
                timings: Timings {
                    predicted_n: Some(case.tokens),
                    predicted_ms: Some(case.tokens as f64 * 10.0),
                    predicted_per_second: Some(case.tps),
                    prompt_ms: Some(50.0),
                    ..Default::default()
                },
                stop_reason_category: StopReasonCategory::Completed,
                output_tokens_estimate: case.tokens,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sample() -> Vec<CompletionRecord> {
        vec![
            record(Case {
                model: "m",
                mode: "text",
                file_bytes: 0,
                user_text_bytes: 500,
                file_bucket: "0:none",
                text_hash: "h1",
                tokens: 100,
                tps: 50.0,
                at: 1,
            }),
            record(Case {
                model: "m",
                mode: "file",
                file_bytes: 200_000,
                user_text_bytes: 500,
                file_bucket: "3:100KB-1MB",
                text_hash: "h1",
                tokens: 600,
                tps: 40.0,
                at: 2,
            }),
            record(Case {
                model: "m",
                mode: "file",
                file_bytes: 5_000,
                user_text_bytes: 0,
                file_bucket: "1:<10KB",
                text_hash: "h2",
                tokens: 2000,
                tps: 45.0,
                at: 3,
            }),
            record(Case {
                model: "m",
                mode: "text",
                file_bytes: 0,
                user_text_bytes: 20,
                file_bucket: "0:none",
                text_hash: "h2",
                tokens: 50,
                tps: 60.0,
                at: 4,
            }),
            record(Case {
                model: "other",
                mode: "text",
                file_bytes: 0,
                user_text_bytes: 10,
                file_bucket: "0:none",
                text_hash: "h3",
                tokens: 10,
                tps: 10.0,
                at: 5,
            }),
        ]
    }

    fn all_dimensions(b: &Breakdowns) -> [&Vec<BucketStats>; 9] {
        [
            &b.input_mode,
            &b.file_size,
            &b.file_kinds,
            &b.image_size,
            &b.image_count,
            &b.user_text_size,
            &b.runtime,
            &b.stop_reason,
            &b.output_length,
        ]
    }

    /// 未指定模型时回退到补全数最多的模型
    #[test]
    fn test_falls_back_to_most_frequent_model() {
        let result = scenario_comparison(&sample(), None);
        assert_eq!(result.selected_model.as_deref(), Some("m"));
        assert_eq!(result.model_options[0].model, "m");
        assert_eq!(result.model_options[0].completions, 4);

        let unknown = scenario_comparison(&sample(), Some("missing"));
        assert_eq!(unknown.selected_model.as_deref(), Some("m"));

        let other = scenario_comparison(&sample(), Some("other"));
        assert_eq!(other.selected_model.as_deref(), Some("other"));
        assert_eq!(other.breakdowns.input_mode[0].count, 1);
    }

    /// 每个维度的桶计数之和等于过滤后的记录数
    #[test]
    fn test_bucket_counts_sum_to_filtered_count() {
        let result = scenario_comparison(&sample(), Some("m"));
        for rows in all_dimensions(&result.breakdowns) {
            let total: u64 = rows.iter().map(|r| r.count).sum();
            assert_eq!(total, 4);
        }
    }

    #[test]
    fn test_ordinal_dimension_sorted_by_label() {
        let result = scenario_comparison(&sample(), Some("m"));
        let labels: Vec<&str> = result
            .breakdowns
            .file_size
            .iter()
            .map(|r| r.label.as_str())
            .collect();
        assert_eq!(labels, vec!["0:none", "1:<10KB", "3:100KB-1MB"]);
    }

    #[test]
    fn test_output_length_has_ms_per_1k() {
        let result = scenario_comparison(&sample(), Some("m"));
        let rows = &result.breakdowns.output_length;
        assert!(rows.iter().all(|r| r.ms_per_1k_output_tokens == Some(10_000.0)));
        assert!(
            result
                .breakdowns
                .input_mode
                .iter()
                .all(|r| r.ms_per_1k_output_tokens.is_none())
        );
        let labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["0-128", "1025+", "513-1024"]);
        assert_eq!(rows[0].count, 2);
    }

    #[test]
    fn test_stop_reason_uses_category() {
        let result = scenario_comparison(&sample(), Some("m"));
        assert_eq!(result.breakdowns.stop_reason.len(), 1);
        assert_eq!(result.breakdowns.stop_reason[0].label, "completed");
    }

    /// 空标签归入 unknown
    #[test]
    fn test_empty_label_maps_to_unknown() {
        let mut records = sample();
        if let Some(request) = records[0].request.as_mut() {
            request.scenario_labels.runtime_bucket = String::new();
        }
        let result = scenario_comparison(&records, Some("m"));
        assert!(result.breakdowns.runtime.iter().all(|r| r.label == "unknown"));
        assert_eq!(result.breakdowns.runtime[0].count, 4);
    }

    #[test]
    fn test_file_vs_text_sorted_by_file_bytes() {
        let result = scenario_comparison(&sample(), Some("m"));
        let rows = &result.comparisons.file_vs_text;
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].file_bytes, 200_000);
        assert_eq!(rows[1].file_bytes, 5_000);
        assert_eq!(rows[2].user_text_bytes, 500);
        assert_eq!(rows[3].user_text_bytes, 20);
    }

    #[test]
    fn test_file_vs_text_limited() {
        let records: Vec<CompletionRecord> = (0..80)
            .map(|i| {
                record(Case {
                    model: "m",
                    mode: "file",
                    file_bytes: 1000 + i,
                    user_text_bytes: 0,
                    file_bucket: "1:<10KB",
                    text_hash: "h",
                    tokens: 10,
                    tps: 1.0,
                    at: i as i64,
                })
            })
            .collect();
        let result = scenario_comparison(&records, None);
        assert_eq!(result.comparisons.file_vs_text.len(), FILE_VS_TEXT_LIMIT);
        assert_eq!(result.comparisons.file_vs_text[0].file_bytes, 1079);
    }

    /// 同一提示在两种输入模式下出现才构成对照组
    #[test]
    fn test_prompt_hash_controls() {
        let mut records = sample();
        records.push(record(Case {
            model: "m",
            mode: "text",
            file_bytes: 0,
            user_text_bytes: 5,
            file_bucket: "0:none",
            text_hash: "solo",
            tokens: 5,
            tps: 5.0,
            at: 9,
        }));
        let result = scenario_comparison(&records, Some("m"));
        let controls = &result.comparisons.prompt_hash_controls;
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0].prompt_hash, "h1");
        assert_eq!(controls[0].completions, 2);
        let modes: Vec<&str> = controls[0].modes.iter().map(|m| m.input_mode.as_str()).collect();
        assert_eq!(modes, vec!["file", "text"]);
        assert_eq!(controls[0].modes[0].avg_predicted_per_second, Some(40.0));
    }

    #[test]
    fn test_order_independent() {
        let mut shuffled = sample();
        shuffled.reverse();
        shuffled.swap(1, 3);
        assert_eq!(
            scenario_comparison(&sample(), None),
            scenario_comparison(&shuffled, None)
        );
    }

    #[test]
    fn test_empty_input() {
        let result = scenario_comparison(&[], Some("m"));
        assert_eq!(result.selected_model, None);
        assert!(result.model_options.is_empty());
        assert!(result.breakdowns.input_mode.is_empty());
        assert!(result.comparisons.file_vs_text.is_empty());
    }
}
