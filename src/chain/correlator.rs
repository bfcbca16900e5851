//! 会话链关联器
//!
//! 底层协议没有会话 ID，只能从消息数单调性、提示哈希和时间接近度推断
//! 新的补全是延续已有对话还是开启新对话。这是启发式判断，不是事实。

use uuid::Uuid;

use super::state::{ChainState, ChainStateStore};
use crate::capture::types::CompletionRecord;

/// 关联器配置
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorConfig {
    /// 空闲超过该时长后强制开启新链
    pub idle_reset_ms: i64,
    /// 相同首轮提示在该窗口内视为重试/重渲染
    pub duplicate_window_ms: i64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            idle_reset_ms: 30 * 60 * 1000,
            duplicate_window_ms: 2 * 60 * 1000,
        }
    }
}

/// 从记录中提取的关联信号
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signals {
    /// 非正数视为缺失
    pub user_count: Option<u32>,
    pub assistant_count: u32,
    pub tool_count: u32,
    pub messages_count: Option<u32>,
    pub prompt_hash: Option<String>,
    pub ui_origin: String,
}

impl Signals {
    pub fn from_record(record: &CompletionRecord) -> Self {
        let positive = |n: u32| (n > 0).then_some(n);
        match &record.request {
            Some(request) => {
                let c = &request.composition;
                Self {
                    user_count: positive(c.user_count),
                    assistant_count: c.assistant_count,
                    tool_count: c.tool_count,
                    messages_count: positive(c.messages_count),
                    prompt_hash: request.prompt_hash.clone(),
                    ui_origin: record.ui_origin.clone(),
                }
            }
            None => Self {
                ui_origin: record.ui_origin.clone(),
                ..Default::default()
            },
        }
    }

    /// 看起来像对话首轮：恰好 1 条用户消息、没有助手/工具消息、总消息数 ≤ 4 或未知
    ///
    /// `≤ 4` 是为系统提示注入留的余量，属于可调的近似
    pub fn looks_like_first_turn(&self) -> bool {
        self.user_count == Some(1)
            && self.assistant_count == 0
            && self.tool_count == 0
            && self.messages_count.is_none_or(|n| n <= 4)
    }
}

/// 开启新链的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateReason {
    NoPriorState,
    Idle,
    OriginChanged,
    UnknownSignals,
    UserCountRegressed,
    FreshFirstTurn,
}

impl RotateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPriorState => "no_prior_state",
            Self::Idle => "idle",
            Self::OriginChanged => "origin_changed",
            Self::UnknownSignals => "unknown_signals",
            Self::UserCountRegressed => "user_count_regressed",
            Self::FreshFirstTurn => "fresh_first_turn",
        }
    }
}

/// 判断是否需要开启新链，返回 None 表示延续当前链
pub fn should_rotate(
    state: Option<&ChainState>,
    signals: &Signals,
    now_ms: i64,
    config: &CorrelatorConfig,
) -> Option<RotateReason> {
    let Some(state) = state else {
        return Some(RotateReason::NoPriorState);
    };
    let since_last = now_ms - state.last_seen_ms;
    if since_last > config.idle_reset_ms {
        return Some(RotateReason::Idle);
    }
    if signals.ui_origin != state.ui_origin {
        return Some(RotateReason::OriginChanged);
    }
    let Some(user_count) = signals.user_count else {
        return Some(RotateReason::UnknownSignals);
    };
    // 同一条链内用户消息数不会回退
    if user_count < state.last_user_message_count {
        return Some(RotateReason::UserCountRegressed);
    }
    if signals.looks_like_first_turn() {
        let duplicate = signals.prompt_hash.is_some()
            && signals.prompt_hash == state.last_prompt_hash
            && since_last <= config.duplicate_window_ms;
        if !duplicate {
            return Some(RotateReason::FreshFirstTurn);
        }
    }
    None
}

/// 关联结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub chain_id: String,
    pub turn_number: u32,
    /// 开启新链的原因，延续时为 None
    pub rotated: Option<RotateReason>,
}

/// 会话链关联器
pub struct Correlator<S> {
    store: S,
    config: CorrelatorConfig,
}

impl<S: ChainStateStore> Correlator<S> {
    pub fn new(store: S, config: CorrelatorConfig) -> Self {
        Self { store, config }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// 为记录盖章 `chain_id`/`turn_number`，并覆盖上下文状态
    ///
    /// 已经盖过章的记录保持不变，也不会改动状态
    pub fn correlate(
        &self,
        context_id: &str,
        record: &mut CompletionRecord,
        now_ms: i64,
    ) -> Correlation {
        if let (Some(chain_id), Some(turn_number)) = (&record.chain_id, record.turn_number) {
            tracing::debug!(trace_id = %record.trace_id, "记录已关联，跳过");
            return Correlation {
                chain_id: chain_id.clone(),
                turn_number,
                rotated: None,
            };
        }

        let signals = Signals::from_record(record);
        let previous = self.store.get(context_id);
        let rotated = should_rotate(previous.as_ref(), &signals, now_ms, &self.config);

        let (chain_id, turn_number) = match (&rotated, previous) {
            (None, Some(prev)) => (prev.chain_id, prev.turn_number.saturating_add(1)),
            _ => (Uuid::new_v4().to_string(), 1),
        };

        self.store.put(
            context_id,
            ChainState {
                chain_id: chain_id.clone(),
                turn_number,
                last_seen_ms: now_ms,
                last_user_message_count: signals.user_count.unwrap_or(0),
                last_total_message_count: signals.messages_count.unwrap_or(0),
                last_prompt_hash: signals.prompt_hash.clone(),
                ui_origin: signals.ui_origin.clone(),
            },
        );
        record.stamp_chain(chain_id.clone(), turn_number);

        match rotated {
            Some(reason) => tracing::debug!(
                context_id = %context_id,
                chain_id = %chain_id,
                reason = reason.as_str(),
                "开启新会话链"
            ),
            None => tracing::debug!(
                context_id = %context_id,
                chain_id = %chain_id,
                turn_number,
                "延续会话链"
            ),
        }

        Correlation {
            chain_id,
            turn_number,
            rotated,
        }
    }

    /// 上下文关闭时清除状态
    pub fn forget(&self, context_id: &str) -> bool {
        self.store.delete(context_id)
    }
}
