//! 会话链关联
//!
//! 为每条补全记录推断所属的多轮对话链

pub mod correlator;
pub mod state;

pub use correlator::{Correlator, CorrelatorConfig};
pub use state::MemoryChainStateStore;
