//! 补全记录持久化
//!
//! 关联后批量写入 SQLite，并提供记录查询与统计 API

mod handlers;
mod router;
pub mod sink;
pub mod store;
pub mod types;

pub use router::create_record_router;
pub use sink::RecordSink;
