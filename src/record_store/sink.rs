//! 异步记录服务：关联后批量入库

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

use super::store::RecordStore;
use super::types::{PendingRecord, RecordListResponse, RecordQuery};
use crate::capture::types::CompletionRecord;
use crate::chain::{Correlator, CorrelatorConfig, MemoryChainStateStore};
use crate::stats::{self, DashboardStats, ScenarioComparison};

const CHANNEL_CAPACITY: usize = 10_000;
const MAX_BATCH: usize = 500;

enum SinkEvent {
    Record {
        context_id: String,
        record: Box<CompletionRecord>,
    },
    ForgetContext(String),
    /// 之前的事件全部落盘后回执
    Flush(oneshot::Sender<()>),
}

/// 记录服务（公开 API）
///
/// 所有写操作经同一个通道进入唯一的后台任务，
/// 所以同一上下文的关联状态按到达顺序串行更新。
pub struct RecordSink {
    sender: mpsc::Sender<SinkEvent>,
    store: Arc<RecordStore>,
    chain_states: Arc<MemoryChainStateStore>,
}

impl RecordSink {
    /// 打开数据库并启动后台任务
    pub fn new(db_path: &str, config: CorrelatorConfig) -> Result<Self> {
        Ok(Self::with_store(RecordStore::new(db_path)?, config))
    }

    pub fn with_store(store: RecordStore, config: CorrelatorConfig) -> Self {
        let store = Arc::new(store);
        let chain_states = Arc::new(MemoryChainStateStore::new());
        let correlator = Correlator::new(chain_states.clone(), config);
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(run(receiver, correlator, store.clone()));

        Self {
            sender,
            store,
            chain_states,
        }
    }

    /// 非阻塞提交一条记录
    pub fn record(&self, context_id: impl Into<String>, record: CompletionRecord) {
        let trace_id = record.trace_id.clone();
        let event = SinkEvent::Record {
            context_id: context_id.into(),
            record: Box::new(record),
        };
        if self.sender.try_send(event).is_err() {
            tracing::warn!(trace_id = %trace_id, "记录通道已满，丢弃记录");
        }
    }

    /// 上下文关闭（标签页关闭），与记录按序处理
    pub fn forget_context(&self, context_id: impl Into<String>) {
        if self
            .sender
            .try_send(SinkEvent::ForgetContext(context_id.into()))
            .is_err()
        {
            tracing::warn!("记录通道已满，丢弃上下文清除事件");
        }
    }

    /// 等待此前提交的事件全部处理完
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(SinkEvent::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// 当前跟踪的上下文数
    pub fn tracked_contexts(&self) -> usize {
        self.chain_states.len()
    }

    pub async fn query(&self, filter: RecordQuery) -> Result<RecordListResponse> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.query(&filter)).await?
    }

    #[cfg(test)]
    pub async fn load_all(&self) -> Result<Vec<CompletionRecord>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.load_all()).await?
    }

    pub async fn clear(&self, before_ms: Option<i64>) -> Result<u64> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear(before_ms)).await?
    }

    /// 概览统计（每次从全部记录重新计算）
    pub async fn dashboard(&self) -> Result<DashboardStats> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<DashboardStats> {
            Ok(stats::dashboard_stats(&store.load_all()?))
        })
        .await?
    }

    /// 场景对比
    pub async fn scenarios(&self, model: Option<String>) -> Result<ScenarioComparison> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<ScenarioComparison> {
            let records = store.load_all()?;
            Ok(stats::scenario_comparison(&records, model.as_deref()))
        })
        .await?
    }
}

async fn run(
    mut receiver: mpsc::Receiver<SinkEvent>,
    correlator: Correlator<Arc<MemoryChainStateStore>>,
    store: Arc<RecordStore>,
) {
    while let Some(first) = receiver.recv().await {
        let mut events = vec![first];
        while events.len() < MAX_BATCH {
            match receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        let mut batch = Vec::with_capacity(events.len());
        let mut acks = Vec::new();
        for event in events {
            match event {
                SinkEvent::Record {
                    context_id,
                    mut record,
                } => {
                    let now_ms = record.captured_at_ms;
                    correlator.correlate(&context_id, &mut record, now_ms);
                    batch.push(PendingRecord {
                        context_id,
                        record: *record,
                    });
                }
                SinkEvent::ForgetContext(context_id) => {
                    if correlator.forget(&context_id) {
                        tracing::debug!(context_id = %context_id, "已清除上下文关联状态");
                    }
                }
                SinkEvent::Flush(ack) => acks.push(ack),
            }
        }

        if !batch.is_empty() {
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || store.insert_batch(&batch)).await;
            match result {
                Ok(Ok(inserted)) => tracing::debug!(inserted, "批量写入补全记录"),
                Ok(Err(e)) => tracing::error!("批量写入补全记录失败: {}", e),
                Err(e) => tracing::error!("写入任务异常退出: {}", e),
            }
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }
}
