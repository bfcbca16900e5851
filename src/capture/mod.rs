//! 流量捕获核心
//!
//! 请求侧归一化、SSE 增量解析，产出 [`CompletionRecord`]

pub mod parser;
pub mod request;
pub mod sse;
pub mod types;

pub use parser::{CaptureContext, ParserConfig, StreamChunk, parse_stream};
pub use request::analyze_request;
