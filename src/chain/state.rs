//! 会话链状态存储
//!
//! 每个上下文（浏览器标签页/会话槽位）保存最近一次的关联快照。
//! 没有显式 TTL：陈旧状态由关联器通过 `last_seen_ms` 自然判定。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// 上下文的最近关联快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    pub chain_id: String,
    pub turn_number: u32,
    pub last_seen_ms: i64,
    pub last_user_message_count: u32,
    pub last_total_message_count: u32,
    pub last_prompt_hash: Option<String>,
    pub ui_origin: String,
}

/// 关联状态存储接口
pub trait ChainStateStore: Send + Sync {
    fn get(&self, context_id: &str) -> Option<ChainState>;
    fn put(&self, context_id: &str, state: ChainState);
    /// 删除上下文状态（标签页关闭），返回是否存在
    fn delete(&self, context_id: &str) -> bool;
}

impl<S: ChainStateStore + ?Sized> ChainStateStore for Arc<S> {
    fn get(&self, context_id: &str) -> Option<ChainState> {
        (**self).get(context_id)
    }

    fn put(&self, context_id: &str, state: ChainState) {
        (**self).put(context_id, state)
    }

    fn delete(&self, context_id: &str) -> bool {
        (**self).delete(context_id)
    }
}

/// 内存实现
#[derive(Debug, Default)]
pub struct MemoryChainStateStore {
    states: RwLock<HashMap<String, ChainState>>,
}

impl MemoryChainStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前跟踪的上下文数
    pub fn len(&self) -> usize {
        self.states.read().len()
    }
}

impl ChainStateStore for MemoryChainStateStore {
    fn get(&self, context_id: &str) -> Option<ChainState> {
        self.states.read().get(context_id).cloned()
    }

    fn put(&self, context_id: &str, state: ChainState) {
        self.states.write().insert(context_id.to_string(), state);
    }

    fn delete(&self, context_id: &str) -> bool {
        self.states.write().remove(context_id).is_some()
    }
}
