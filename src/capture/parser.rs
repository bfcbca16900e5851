//! SSE 流解析器
//!
//! 把 chat completion 的 SSE 字节流转换为至多一条 [`CompletionRecord`]。
//! 解析器是纯消费者：捕获层把字节分片推入 channel，解析任务读到终止块、
//! `[DONE]` 或 EOF 为止。找不到带 timings 的终止块时不产出任何记录，
//! 这是预期内的常见情况（例如客户端中断生成），不视为错误。

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use super::request::output_length_bucket;
use super::sse::SseLineDecoder;
use super::types::{
    ClientTiming, CompletionRecord, DerivedSplit, RequestInfo, ResponseInfo, StopReasonCategory,
    Timings,
};
use crate::common::now_ms;

/// chunk 对象的类型标识
const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// 估算输出长度时每 token 的字符数
const CHARS_PER_TOKEN: u64 = 4;

/// 可见回答文本字段
const CONTENT_FIELDS: &[&str] = &["content"];
/// 思考文本字段（不同服务端命名不一）
const REASONING_FIELDS: &[&str] = &["reasoning_content", "reasoning", "thinking"];

/// 解析器配置
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    /// 每条记录最多保留的文本字符数（回答、思考各自计算）
    pub max_captured_chars: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_captured_chars: 200_000,
        }
    }
}

/// 请求侧已计算好的上下文
#[derive(Debug, Clone)]
pub struct CaptureContext {
    pub trace_id: String,
    pub ui_origin: String,
    pub endpoint: String,
    pub request: RequestInfo,
    /// 发出请求的时间点
    pub request_start_ms: Option<i64>,
    /// 收到响应头的时间点
    pub headers_ms: Option<i64>,
}

/// 喂入字节后的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// 需要更多数据
    Continue,
    /// 已遇到终止边界，后续字节可以丢弃
    Finished,
}

/// 携带 timings 的 chunk
#[derive(Debug, Clone)]
struct TimedChunk {
    timings: Timings,
    finish_reason: Option<String>,
}

/// 单次响应的增量解析状态
pub struct StreamParser {
    ctx: CaptureContext,
    config: ParserConfig,
    decoder: SseLineDecoder,

    id: Option<String>,
    created: Option<i64>,
    model: Option<String>,
    system_fingerprint: Option<String>,

    content_text: String,
    content_chars: usize,
    reasoning_text: String,
    reasoning_chars: usize,
    text_truncated: bool,
    reasoning_observed: bool,

    /// 思考与回答的分界（predicted_n, predicted_ms）
    reasoning_boundary: Option<(u64, f64)>,
    last_timed: Option<TimedChunk>,
    last_finish_reason: Option<String>,
    terminal: Option<TimedChunk>,
    done: bool,

    first_chunk_ms: Option<i64>,
    stop_ms: Option<i64>,
}

impl StreamParser {
    pub fn new(ctx: CaptureContext, config: ParserConfig) -> Self {
        Self {
            ctx,
            config,
            decoder: SseLineDecoder::new(),
            id: None,
            created: None,
            model: None,
            system_fingerprint: None,
            content_text: String::new(),
            content_chars: 0,
            reasoning_text: String::new(),
            reasoning_chars: 0,
            text_truncated: false,
            reasoning_observed: false,
            reasoning_boundary: None,
            last_timed: None,
            last_finish_reason: None,
            terminal: None,
            done: false,
            first_chunk_ms: None,
            stop_ms: None,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.ctx.trace_id
    }

    /// 是否已经到达终止边界
    pub fn is_finished(&self) -> bool {
        self.terminal.is_some() || self.done
    }

    /// 喂入一段原始字节
    pub fn feed(&mut self, chunk: &[u8], now_ms: i64) -> Feed {
        if self.is_finished() {
            return Feed::Finished;
        }
        for payload in self.decoder.feed(chunk) {
            if self.handle_payload(&payload, now_ms) == Feed::Finished {
                return Feed::Finished;
            }
        }
        Feed::Continue
    }

    /// 流结束（EOF 或终止块），产出记录；没有任何 timings 时返回 None
    pub fn finish(mut self, now_ms: i64) -> Option<CompletionRecord> {
        if !self.is_finished() {
            if let Some(payload) = self.decoder.flush() {
                self.handle_payload(&payload, now_ms);
            }
        }
        if self.terminal.is_none() {
            // EOF 之前没有终止块：降级使用最后一个带 timings 的 chunk
            if let Some(last) = self.last_timed.take() {
                self.terminal = Some(TimedChunk {
                    timings: last.timings,
                    finish_reason: last.finish_reason.or_else(|| self.last_finish_reason.clone()),
                });
                self.stop_ms = Some(now_ms);
            }
        }
        let terminal = self.terminal.take()?;
        Some(self.build_record(terminal, now_ms))
    }

    fn handle_payload(&mut self, payload: &str, now_ms: i64) -> Feed {
        if payload == "[DONE]" {
            self.done = true;
            if self.terminal.is_none() {
                if let Some(last) = self.last_timed.take() {
                    self.terminal = Some(TimedChunk {
                        timings: last.timings,
                        finish_reason: last
                            .finish_reason
                            .or_else(|| Some("done".to_string())),
                    });
                    self.stop_ms = Some(now_ms);
                }
            }
            return Feed::Finished;
        }

        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            tracing::trace!(trace_id = %self.ctx.trace_id, "跳过无法解析的 SSE 负载");
            return Feed::Continue;
        };
        if chunk.get("object").and_then(Value::as_str) != Some(CHUNK_OBJECT) {
            return Feed::Continue;
        }

        if self.first_chunk_ms.is_none() {
            self.first_chunk_ms = Some(now_ms);
        }
        self.track_identity(&chunk);

        let choice = chunk.pointer("/choices/0");
        let delta = choice.and_then(|c| c.get("delta"));
        let content = delta.and_then(|d| first_text(d, CONTENT_FIELDS));
        let reasoning = delta.and_then(|d| first_text(d, REASONING_FIELDS));
        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        let timings = chunk.get("timings").and_then(Timings::from_value);

        if let Some(text) = content {
            let budget = self.config.max_captured_chars;
            if push_capped(&mut self.content_text, &mut self.content_chars, text, budget) {
                self.text_truncated = true;
            }
        }
        if let Some(text) = reasoning {
            self.reasoning_observed = true;
            let budget = self.config.max_captured_chars;
            if push_capped(&mut self.reasoning_text, &mut self.reasoning_chars, text, budget) {
                self.text_truncated = true;
            }
            if let Some(t) = &timings {
                self.reasoning_boundary = Some((
                    t.predicted_n.unwrap_or(0),
                    t.predicted_ms.unwrap_or(0.0),
                ));
            }
        }
        if finish_reason.is_some() {
            self.last_finish_reason = finish_reason.clone();
        }

        if let Some(timings) = timings {
            let timed = TimedChunk {
                timings,
                finish_reason: finish_reason.clone(),
            };
            if finish_reason.is_some() {
                self.terminal = Some(timed);
                self.stop_ms = Some(now_ms);
                return Feed::Finished;
            }
            self.last_timed = Some(timed);
        }
        Feed::Continue
    }

    /// 首个非空的 id/created/model/fingerprint 生效
    fn track_identity(&mut self, chunk: &Value) {
        let text = |key: &str| {
            chunk
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if self.id.is_none() {
            self.id = text("id");
        }
        if self.created.is_none() {
            self.created = chunk.get("created").and_then(Value::as_i64);
        }
        if self.model.is_none() {
            self.model = text("model");
        }
        if self.system_fingerprint.is_none() {
            self.system_fingerprint = text("system_fingerprint");
        }
    }

    fn build_record(self, terminal: TimedChunk, now_ms: i64) -> CompletionRecord {
        let timings = terminal.timings;
        let derived = derive_split(&timings, self.reasoning_observed, self.reasoning_boundary);

        let output_tokens_estimate = timings.predicted_n.unwrap_or_else(|| {
            let chars = (self.content_chars + self.reasoning_chars) as u64;
            chars.div_ceil(CHARS_PER_TOKEN)
        });

        let client_timing = ClientTiming::from_marks(
            self.ctx.request_start_ms,
            self.ctx.headers_ms,
            self.first_chunk_ms,
            self.stop_ms,
        );

        tracing::debug!(
            trace_id = %self.ctx.trace_id,
            predicted_n = ?timings.predicted_n,
            reasoning_n = derived.reasoning_n,
            finish_reason = ?terminal.finish_reason,
            "解析完成"
        );

        let response = ResponseInfo {
            id: self.id,
            created: self.created,
            model: self.model,
            system_fingerprint: self.system_fingerprint,
            timings,
            derived,
            client_timing,
            stop_reason_category: StopReasonCategory::from_finish_reason(
                terminal.finish_reason.as_deref(),
            ),
            finish_reason: terminal.finish_reason,
            output_tokens_estimate,
            output_chars_estimate: output_tokens_estimate * CHARS_PER_TOKEN,
            output_length_bucket: output_length_bucket(output_tokens_estimate).to_string(),
            content_text: self.content_text,
            reasoning_text: self.reasoning_text,
            text_truncated: self.text_truncated,
        };

        CompletionRecord {
            trace_id: self.ctx.trace_id,
            captured_at_ms: now_ms,
            ui_origin: self.ctx.ui_origin,
            endpoint: self.ctx.endpoint,
            request: Some(self.ctx.request),
            response: Some(response),
            chain_id: None,
            turn_number: None,
        }
    }
}

/// 捕获层复制出的一段响应字节及其到达转发服务的时间
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub received_ms: i64,
    pub bytes: Bytes,
}

impl StreamChunk {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            received_ms: now_ms(),
            bytes,
        }
    }
}

/// 从 channel 消费字节直到终止边界或发送端关闭
///
/// 捕获层持有发送端；响应体被原始调用方读完或丢弃时发送端随之释放，
/// 这里会读到 None 并按 EOF 收尾。客户端计时取分片的到达时间，
/// 与解析任务何时开始消费无关。
pub async fn parse_stream(
    mut rx: mpsc::UnboundedReceiver<StreamChunk>,
    ctx: CaptureContext,
    config: ParserConfig,
) -> Option<CompletionRecord> {
    let mut parser = StreamParser::new(ctx, config);
    let mut last_received_ms = None;
    while let Some(chunk) = rx.recv().await {
        last_received_ms = Some(chunk.received_ms);
        if parser.feed(&chunk.bytes, chunk.received_ms) == Feed::Finished {
            break;
        }
    }
    rx.close();

    let trace_id = parser.trace_id().to_string();
    let record = parser.finish(last_received_ms.unwrap_or_else(now_ms));
    if record.is_none() {
        tracing::debug!(trace_id = %trace_id, "流结束但没有 timings，不产出记录");
    }
    record
}

/// 思考/回答拆分；没有观察到思考内容时回答指标等于总量
fn derive_split(
    timings: &Timings,
    reasoning_observed: bool,
    boundary: Option<(u64, f64)>,
) -> DerivedSplit {
    let total_n = timings.predicted_n.unwrap_or(0);
    let total_ms = timings.predicted_ms.unwrap_or(0.0).max(0.0);

    let (reasoning_n, reasoning_ms) = match (reasoning_observed, boundary) {
        (true, Some((n, ms))) => (n.min(total_n), ms.max(0.0).min(total_ms)),
        _ => (0, 0.0),
    };
    let content_n = total_n.saturating_sub(reasoning_n);
    let content_ms = (total_ms - reasoning_ms).max(0.0);

    DerivedSplit {
        reasoning_n,
        reasoning_ms,
        content_n,
        content_ms,
        reasoning_per_second: per_second(reasoning_n, reasoning_ms),
        content_per_second: per_second(content_n, content_ms),
        reasoning_observed,
    }
}

fn per_second(n: u64, ms: f64) -> Option<f64> {
    if ms <= 0.0 {
        return None;
    }
    crate::stats::round2(n as f64 * 1000.0 / ms)
}

/// 依次尝试候选字段，返回第一个非空字符串
fn first_text<'a>(delta: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|f| delta.get(*f).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// 追加文本但不超过字符预算，发生截断时返回 true
fn push_capped(buf: &mut String, count: &mut usize, text: &str, max_chars: usize) -> bool {
    let remaining = max_chars.saturating_sub(*count);
    if remaining == 0 {
        return true;
    }
    let taken = crate::common::truncate_chars(text, remaining);
    let taken_chars = taken.chars().count();
    buf.push_str(taken);
    *count += taken_chars;
    taken.len() < text.len()
}
